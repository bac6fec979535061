//! Tunnel ACLs: IPv4 CIDR allow-lists evaluated at tunnel-accept time
//!
//! An ACL string is a comma-separated list of dotted-quad entries with an
//! optional `/prefix` (a bare address means `/32`). An empty ACL allows
//! every source address.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// ACL parse errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AclError {
    #[error("invalid IP addr: {0}")]
    InvalidIpAddress(String),

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("{0} is not an IPv4 address")]
    NotIpv4(String),

    #[error("0.0.0.0 would allow access to everyone. If that's what you want, do not set the ACL")]
    Unspecified,
}

/// One IPv4 network entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Ipv4Network {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Network {
    fn parse(s: &str) -> Result<Self, AclError> {
        let (ip_str, prefix_len) = match s.split_once('/') {
            Some((ip_str, prefix_str)) => {
                let prefix_len = prefix_str
                    .parse::<u8>()
                    .map_err(|_| AclError::InvalidCidr(s.to_string()))?;
                if prefix_len > 32 {
                    return Err(AclError::InvalidCidr(s.to_string()));
                }
                (ip_str, prefix_len)
            }
            None => (s, 32),
        };

        let addr = match IpAddr::from_str(ip_str.trim()) {
            Ok(IpAddr::V4(v4)) => v4,
            Ok(IpAddr::V6(_)) => return Err(AclError::NotIpv4(s.to_string())),
            Err(_) => return Err(AclError::InvalidIpAddress(s.to_string())),
        };

        if addr.is_unspecified() {
            return Err(AclError::Unspecified);
        }

        Ok(Self { addr, prefix_len })
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let net_bits = u32::from(self.addr);
        let test_bits = u32::from(ip);
        let mask = !0u32 << (32 - self.prefix_len);
        (net_bits & mask) == (test_bits & mask)
    }
}

/// Ordered IPv4 allow-list for inbound tunnel connections.
///
/// An empty list is the allow-all sentinel; anything IPv6 is denied by a
/// non-empty list since entries are IPv4-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelAcl {
    entries: Vec<Ipv4Network>,
    source: String,
}

/// Equality is semantic: the same set of networks counts as the same ACL,
/// whatever the order or spelling of the source string.
impl PartialEq for TunnelAcl {
    fn eq(&self, other: &Self) -> bool {
        let mut ours = self.entries.clone();
        let mut theirs = other.entries.clone();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }
}

impl Eq for TunnelAcl {}

impl TunnelAcl {
    /// The allow-all sentinel
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse a comma-separated ACL string. An empty string yields the
    /// allow-all sentinel.
    pub fn parse(s: &str) -> Result<Self, AclError> {
        if s.is_empty() {
            return Ok(Self::allow_all());
        }

        let mut entries = Vec::new();
        for part in s.split(',') {
            entries.push(Ipv4Network::parse(part.trim())?);
        }

        Ok(Self {
            entries,
            source: s.to_string(),
        })
    }

    /// Returns true if a connection from `ip` is allowed
    pub fn check(&self, ip: IpAddr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        match ip {
            IpAddr::V4(v4) => self.entries.iter().any(|net| net.contains(v4)),
            IpAddr::V6(_) => false,
        }
    }

    pub fn is_allow_all(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ACL string this list was parsed from
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for TunnelAcl {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
