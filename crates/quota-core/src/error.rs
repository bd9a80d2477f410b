use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by flow-quota.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A string is not a valid IPv4 or IPv6 address.
    #[error("Invalid IP address format: {0}")]
    InvalidAddress(String),

    /// A log line is not a well-formed flow record.
    #[error("Malformed flow record: {0}")]
    MalformedRecord(String),

    /// A compressed log could not be expanded.
    #[error("Failed to decompress {path}: {source}")]
    Decompression {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A row of the persisted ledger could not be understood.
    #[error("Corrupt ledger {path} at row {line}: {reason}")]
    LedgerCorrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The ledger could not be written.
    #[error("Failed to persist ledger to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the quota crates.
pub type Result<T> = std::result::Result<T, QuotaError>;
