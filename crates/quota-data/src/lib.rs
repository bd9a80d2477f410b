//! Data layer for flow-quota.
//!
//! Responsible for discovering flow logs on disk, expanding gzip archives,
//! parsing JSON flow records and persisting the usage ledger.

pub mod archive;
pub mod ledger;
pub mod reader;

pub use quota_core as core;
