//! The cluster's static node table — spec.md §6's "a startup-time
//! exchange of IP:port pairs, one per node, indexed by node id." This
//! crate does not perform that exchange (initial RDMA bring-up, queue
//! pair setup, and connection handshaking are explicitly out of scope
//! per spec.md §1); `NodeTable` is the typed result such a handshake
//! would hand the rest of the stack — a fixed mapping from [`NodeId`] to
//! address, looked up by [`crate::coherence::Fabric`] implementations
//! that need real endpoints rather than [`crate::coherence::LoopbackFabric`]'s
//! in-process registration.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::common::{Error, NodeId, Result};

/// A fixed `NodeId -> SocketAddr` mapping, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    addrs: HashMap<NodeId, SocketAddr>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self { addrs: HashMap::new() }
    }

    /// Build a table from an ordered list of `(ip, port)` pairs, one per
    /// node id starting at 0 — the shape a `--nodes` CLI flag or a static
    /// config file naturally produces.
    pub fn from_addrs(addrs: impl IntoIterator<Item = (IpAddr, u16)>) -> Self {
        let mut table = Self::new();
        for (id, (ip, port)) in addrs.into_iter().enumerate() {
            table.insert(NodeId::new(id as u8), SocketAddr::new(ip, port));
        }
        table
    }

    pub fn insert(&mut self, node: NodeId, addr: SocketAddr) {
        self.addrs.insert(node, addr);
    }

    pub fn get(&self, node: NodeId) -> Result<SocketAddr> {
        self.addrs.get(&node).copied().ok_or(Error::UnknownNode(node))
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn from_addrs_assigns_ids_in_order() {
        let table = NodeTable::from_addrs([
            (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7174),
            (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 7174),
        ]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(NodeId::new(0)).unwrap().port(), 7174);
        assert_eq!(table.get(NodeId::new(1)).unwrap().ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn unknown_node_is_an_error() {
        let table = NodeTable::new();
        assert!(matches!(table.get(NodeId::new(3)), Err(Error::UnknownNode(_))));
    }
}
