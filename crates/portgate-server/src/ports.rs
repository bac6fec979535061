//! Port distributor
//!
//! Tracks which ports of the configured allow-set are currently free for
//! dynamic tunnel allocation. Pools are built per protocol on first use (or
//! on [`PortDistributor::refresh`]) as `allowed − busy`, with busy ports
//! sampled from the OS.

use crate::probe;
use portgate_proto::Protocol;
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

/// Port allocation errors
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no ports available")]
    NoPorts,

    #[error("failed to sample busy ports: {0}")]
    Probe(#[from] std::io::Error),
}

/// Thread-safe distributor over the configured allow-set
pub struct PortDistributor {
    allowed: BTreeSet<u16>,
    pools: RwLock<HashMap<Protocol, HashSet<u16>>>,
}

impl PortDistributor {
    pub fn new(allowed: BTreeSet<u16>) -> Self {
        Self {
            allowed,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Construct with pre-built pools, bypassing the OS probe
    pub fn with_pools(
        allowed: BTreeSet<u16>,
        tcp_pool: HashSet<u16>,
        udp_pool: HashSet<u16>,
    ) -> Self {
        let mut pools = HashMap::new();
        pools.insert(Protocol::Tcp, tcp_pool);
        pools.insert(Protocol::Udp, udp_pool);
        Self {
            allowed,
            pools: RwLock::new(pools),
        }
    }

    /// Remove and return an arbitrary free port for the protocol. For
    /// `tcp+udp` the port is removed from both sub-pools.
    pub fn get_random_port(&self, protocol: Protocol) -> Result<u16, PortError> {
        for sub in protocol.sub_protocols() {
            self.ensure_pool(*sub)?;
        }

        let mut pools = self.pools.write().unwrap();
        let port = {
            let candidates = effective_pool(&pools, protocol);
            candidates
                .into_iter()
                .choose(&mut rand::thread_rng())
                .ok_or(PortError::NoPorts)?
        };

        for sub in protocol.sub_protocols() {
            if let Some(pool) = pools.get_mut(sub) {
                pool.remove(&port);
            }
        }

        Ok(port)
    }

    /// Whether the port is inside the configured allow-set
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed.contains(&port)
    }

    /// Whether the port is currently taken for the protocol
    pub fn is_port_busy(&self, protocol: Protocol, port: u16) -> Result<bool, PortError> {
        for sub in protocol.sub_protocols() {
            self.ensure_pool(*sub)?;
        }
        let pools = self.pools.read().unwrap();
        Ok(!effective_pool(&pools, protocol).contains(&port))
    }

    /// Re-sample the OS and rebuild all pools
    pub fn refresh(&self) -> Result<(), PortError> {
        self.rebuild_pool(Protocol::Tcp)?;
        self.rebuild_pool(Protocol::Udp)?;
        Ok(())
    }

    fn ensure_pool(&self, protocol: Protocol) -> Result<(), PortError> {
        {
            let pools = self.pools.read().unwrap();
            if pools.contains_key(&protocol) {
                return Ok(());
            }
        }
        self.rebuild_pool(protocol)
    }

    fn rebuild_pool(&self, protocol: Protocol) -> Result<(), PortError> {
        let busy = probe::list_busy_ports(protocol)?;
        let pool: HashSet<u16> = self
            .allowed
            .iter()
            .copied()
            .filter(|port| !busy.contains(port))
            .collect();
        self.pools.write().unwrap().insert(protocol, pool);
        Ok(())
    }
}

/// The pool backing a protocol; for `tcp+udp` the intersection of both
fn effective_pool(pools: &HashMap<Protocol, HashSet<u16>>, protocol: Protocol) -> HashSet<u16> {
    match protocol {
        Protocol::Tcp | Protocol::Udp => pools.get(&protocol).cloned().unwrap_or_default(),
        Protocol::TcpUdp => {
            let tcp = pools.get(&Protocol::Tcp).cloned().unwrap_or_default();
            match pools.get(&Protocol::Udp) {
                Some(udp) => tcp.intersection(udp).copied().collect(),
                None => HashSet::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distributor(tcp: &[u16], udp: &[u16]) -> PortDistributor {
        let allowed: BTreeSet<u16> = tcp.iter().chain(udp.iter()).copied().collect();
        PortDistributor::with_pools(
            allowed,
            tcp.iter().copied().collect(),
            udp.iter().copied().collect(),
        )
    }

    #[test]
    fn test_drains_pool_then_no_ports() {
        let d = distributor(&[45, 46], &[]);

        let first = d.get_random_port(Protocol::Tcp).unwrap();
        let second = d.get_random_port(Protocol::Tcp).unwrap();
        let mut got = vec![first, second];
        got.sort_unstable();
        assert_eq!(got, vec![45, 46]);

        assert!(matches!(
            d.get_random_port(Protocol::Tcp),
            Err(PortError::NoPorts)
        ));
    }

    #[test]
    fn test_tcp_udp_uses_intersection_and_drains_both() {
        let d = distributor(&[100, 101], &[101, 102]);

        let port = d.get_random_port(Protocol::TcpUdp).unwrap();
        assert_eq!(port, 101);

        // 101 is gone from both sub-pools
        assert!(d.is_port_busy(Protocol::Tcp, 101).unwrap());
        assert!(d.is_port_busy(Protocol::Udp, 101).unwrap());
        // the others survive
        assert!(!d.is_port_busy(Protocol::Tcp, 100).unwrap());
        assert!(!d.is_port_busy(Protocol::Udp, 102).unwrap());

        assert!(matches!(
            d.get_random_port(Protocol::TcpUdp),
            Err(PortError::NoPorts)
        ));
    }

    #[test]
    fn test_is_port_allowed() {
        let d = distributor(&[45, 46], &[]);
        assert!(d.is_port_allowed(45));
        assert!(!d.is_port_allowed(47));
    }

    #[test]
    fn test_is_port_busy_for_missing_pool_member() {
        let d = distributor(&[45], &[]);
        // not in the pool at all counts as busy
        assert!(d.is_port_busy(Protocol::Tcp, 9999).unwrap());
        assert!(!d.is_port_busy(Protocol::Tcp, 45).unwrap());
    }
}
