//! Core types for flow-quota.
//!
//! Holds the error type, the flow and ledger models, address classification,
//! billing-period helpers and configuration.

pub mod error;
pub mod formatting;
pub mod models;
pub mod network;
pub mod settings;
pub mod time_utils;
