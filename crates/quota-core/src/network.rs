//! Internal/external address classification and flow attribution.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

use crate::error::{QuotaError, Result};
use crate::models::FlowRecord;

/// The RFC 1918 private IPv4 blocks.
pub const DEFAULT_INTERNAL_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Which endpoint of a flow, if any, is billed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// The originator is internal and the responder external.
    Origin(IpAddr),
    /// The responder is internal and the originator external.
    Responder(IpAddr),
    /// Both internal, both external, or an endpoint is missing or invalid.
    Unattributed,
}

impl Attribution {
    /// The billed host, if any.
    pub fn host(&self) -> Option<IpAddr> {
        match self {
            Attribution::Origin(ip) | Attribution::Responder(ip) => Some(*ip),
            Attribution::Unattributed => None,
        }
    }
}

/// Parse an address literal into a host identity.
pub fn parse_host(address: &str) -> Result<IpAddr> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| QuotaError::InvalidAddress(address.to_string()))
}

/// Decides whether addresses belong to the monitored network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkClassifier {
    ranges: Vec<IpNet>,
}

impl Default for NetworkClassifier {
    fn default() -> Self {
        let ranges = DEFAULT_INTERNAL_RANGES
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect();
        Self { ranges }
    }
}

impl NetworkClassifier {
    pub fn new(ranges: Vec<IpNet>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }

    /// `true` when `ip` falls within at least one internal block.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|net| net.contains(ip))
    }

    /// Fail-closed membership test on a textual address.
    ///
    /// Anything that does not parse as an IP address is reported and treated
    /// as external.
    pub fn is_internal(&self, address: &str) -> bool {
        match parse_host(address) {
            Ok(ip) => self.contains(&ip),
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Decide which endpoint of a flow is billed.
    ///
    /// Both endpoints are validated first; a missing or invalid address on
    /// either side means nobody is billed.
    pub fn classify_flow(&self, origin: Option<&str>, responder: Option<&str>) -> Attribution {
        let (Some(orig), Some(resp)) = (validated(origin), validated(responder)) else {
            return Attribution::Unattributed;
        };

        match (self.contains(&orig), self.contains(&resp)) {
            (true, false) => Attribution::Origin(orig),
            (false, true) => Attribution::Responder(resp),
            _ => Attribution::Unattributed,
        }
    }

    /// Convenience wrapper over [`classify_flow`](Self::classify_flow).
    pub fn classify(&self, record: &FlowRecord) -> Attribution {
        self.classify_flow(record.origin.as_deref(), record.responder.as_deref())
    }
}

fn validated(address: Option<&str>) -> Option<IpAddr> {
    let Some(address) = address else {
        warn!("Invalid IP address format: <missing>");
        return None;
    };
    match parse_host(address) {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}
