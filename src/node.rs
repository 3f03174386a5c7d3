use crate::error::DhtError;
use crate::id::NodeId;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Consecutive query failures before a node is considered bad.
pub const MAX_FAILURES: u8 = 5;

/// Seconds of silence after which a node stops counting as active.
pub const ACTIVE_WINDOW_SECS: u64 = 15 * 60;

/// Minimum age before a bad node is evicted from its bucket.
pub const BAD_RETENTION_SECS: u64 = 4 * 60 * 60;

/// Size of a compact node entry: 20-byte id, 4-byte IPv4, 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

/// A remote DHT node tracked in the routing table.
///
/// Health is derived, never stored: a node is *bad* once it has accumulated
/// [`MAX_FAILURES`] consecutive failures, *good* while its `active` flag is
/// set, and *questionable* otherwise. The `active` flag is recomputed from
/// `last_seen` during periodic maintenance rather than on every access.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    /// Epoch seconds of the last message received from this node.
    pub last_seen: u64,
    /// Epoch seconds when the node was first added.
    pub first_seen: u64,
    pub active: bool,
    pub failures: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddrV4, now: u64) -> Self {
        Node {
            id,
            addr,
            last_seen: now,
            first_seen: now,
            active: true,
            failures: 0,
        }
    }

    /// Records a reply from this node, clearing any accumulated failures.
    pub fn mark_replied(&mut self, now: u64) {
        self.last_seen = now;
        self.active = true;
        self.failures = 0;
    }

    /// Records a query failure.
    pub fn mark_failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Re-derives the `active` flag from `last_seen`.
    pub fn recompute_active(&mut self, now: u64) {
        self.active = now.saturating_sub(self.last_seen) < ACTIVE_WINDOW_SECS;
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn is_good(&self) -> bool {
        self.active && !self.is_bad()
    }

    pub fn is_questionable(&self) -> bool {
        !self.active && !self.is_bad()
    }

    /// Seconds since this node was first added.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.first_seen)
    }

    /// Serializes to the 26-byte compact node format.
    pub fn to_compact(&self) -> [u8; COMPACT_NODE_LEN] {
        let mut buf = [0u8; COMPACT_NODE_LEN];
        buf[..20].copy_from_slice(self.id.as_bytes());
        buf[20..24].copy_from_slice(&self.addr.ip().octets());
        buf[24..26].copy_from_slice(&self.addr.port().to_be_bytes());
        buf
    }

    /// Parses one entry of the 26-byte compact node format.
    pub fn from_compact(data: &[u8], now: u64) -> Result<Self, DhtError> {
        if data.len() < COMPACT_NODE_LEN {
            return Err(DhtError::Protocol("compact node entry too short".into()));
        }
        let id = NodeId::from_bytes(&data[..20])?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Ok(Node::new(id, SocketAddrV4::new(ip, port), now))
    }
}
