//! Runtime orchestration layer for flow-quota.
//!
//! Runs the accrual engine: rollover, ledger load, discovery, parallel
//! archive expansion, sequential parsing and persistence.

pub mod decompression;
pub mod engine;

pub use quota_core as core;
pub use quota_data as data;
