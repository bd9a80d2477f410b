use std::collections::BTreeMap;
use std::net::IpAddr;

/// Number of bytes in one gibibyte (2^30).
pub const BYTES_PER_GIB: f64 = 1_073_741_824.0;

/// A single network flow read from one line of a JSON log.
///
/// Addresses are kept as the raw text found in the log; validation is the
/// classifier's job so that bad addresses are rejected in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    /// Address that initiated the flow (`id.orig_h`).
    pub origin: Option<String>,
    /// Address that answered the flow (`id.resp_h`).
    pub responder: Option<String>,
    /// Payload bytes sent by the originator.
    pub orig_bytes: u64,
    /// Payload bytes sent by the responder.
    pub resp_bytes: u64,
    /// Event timestamp, verbatim.
    pub timestamp: String,
}

impl FlowRecord {
    /// Bytes charged for this flow: both directions combined.
    pub fn total_bytes(&self) -> u64 {
        self.orig_bytes.saturating_add(self.resp_bytes)
    }
}

/// Accumulated usage for one host within the current billing period.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEntry {
    /// Bytes transferred since the last rollover.
    pub cumulative_bytes: f64,
    /// Timestamp of the most recently merged flow for this host.
    pub last_timestamp: String,
}

impl UsageEntry {
    /// Cumulative usage expressed in gibibytes.
    pub fn gibibytes(&self) -> f64 {
        self.cumulative_bytes / BYTES_PER_GIB
    }
}

/// Per-host usage table for the current billing period.
///
/// Keyed by parsed address so that textual variants of the same IPv6 address
/// collapse into one entry. A `BTreeMap` keeps iteration (and therefore the
/// persisted row order) stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    entries: BTreeMap<IpAddr, UsageEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta_bytes` to `host`, creating the entry on first use.
    ///
    /// The stored timestamp is always replaced, so it reflects the record
    /// merged last rather than the chronologically latest one.
    pub fn merge(&mut self, host: IpAddr, delta_bytes: f64, timestamp: &str) {
        match self.entries.get_mut(&host) {
            Some(entry) => {
                entry.cumulative_bytes += delta_bytes;
                entry.last_timestamp = timestamp.to_string();
                tracing::debug!(
                    %host,
                    bytes = entry.cumulative_bytes,
                    last = %entry.last_timestamp,
                    "updated existing host"
                );
            }
            None => {
                tracing::debug!(%host, bytes = delta_bytes, last = %timestamp, "added new host");
                self.entries.insert(
                    host,
                    UsageEntry {
                        cumulative_bytes: delta_bytes,
                        last_timestamp: timestamp.to_string(),
                    },
                );
            }
        }
    }

    /// Insert a fully formed entry, replacing any existing one.
    ///
    /// Used when restoring a persisted ledger.
    pub fn insert(&mut self, host: IpAddr, entry: UsageEntry) -> Option<UsageEntry> {
        self.entries.insert(host, entry)
    }

    pub fn get(&self, host: &IpAddr) -> Option<&UsageEntry> {
        self.entries.get(host)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &UsageEntry)> {
        self.entries.iter()
    }

    /// Sum of all hosts' usage, in bytes.
    pub fn total_bytes(&self) -> f64 {
        self.entries.values().map(|e| e.cumulative_bytes).sum()
    }
}
