//! Bounded per-info-hash sets of announced peer endpoints.

use crate::id::NodeId;
use std::collections::HashMap;
use std::net::SocketAddrV4;

/// Peers remembered per info-hash.
pub const MAX_PEERS: usize = 32;

#[derive(Debug, Clone)]
struct TrackedPeer {
    addr: SocketAddrV4,
    last_seen: u64,
}

/// Announced peers for a single info-hash, recency-evicted at [`MAX_PEERS`].
#[derive(Debug, Default)]
pub struct PeerTracker {
    peers: Vec<TrackedPeer>,
}

impl PeerTracker {
    /// Records an announce. A peer re-announcing from the same IP has its
    /// port and timestamp refreshed; once full, the least recently seen
    /// entry is overwritten.
    pub fn add_peer(&mut self, addr: SocketAddrV4, now: u64) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.addr.ip() == addr.ip()) {
            peer.addr = addr;
            peer.last_seen = now;
            return;
        }
        if self.peers.len() < MAX_PEERS {
            self.peers.push(TrackedPeer { addr, last_seen: now });
            return;
        }
        let oldest = self
            .peers
            .iter_mut()
            .min_by_key(|p| p.last_seen)
            .unwrap();
        oldest.addr = addr;
        oldest.last_seen = now;
    }

    /// Returns up to `max` peer endpoints.
    ///
    /// When more are stored than requested, a contiguous window at a
    /// randomized offset is returned so that repeated queries spread load
    /// across the whole set.
    pub fn sample_peers(&self, max: usize) -> Vec<SocketAddrV4> {
        if max == 0 || self.peers.is_empty() {
            return Vec::new();
        }
        if self.peers.len() <= max {
            return self.peers.iter().map(|p| p.addr).collect();
        }
        let n = self.peers.len();
        let blocks = n.div_ceil(max);
        let start = (rand::random_range(0..blocks) * (n - max)) / (blocks - 1);
        self.peers[start..start + max].iter().map(|p| p.addr).collect()
    }

    /// Drops entries not seen within `max_age` seconds.
    pub fn prune(&mut self, now: u64, max_age: u64) {
        self.peers.retain(|p| now.saturating_sub(p.last_seen) < max_age);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// All trackers, keyed by info-hash. Trackers are created lazily on the
/// first announce and destroyed once pruning empties them.
#[derive(Debug, Default)]
pub struct PeerStore {
    trackers: HashMap<NodeId, PeerTracker>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, info_hash: NodeId, addr: SocketAddrV4, now: u64) {
        self.trackers.entry(info_hash).or_default().add_peer(addr, now);
    }

    pub fn sample_peers(&self, info_hash: &NodeId, max: usize) -> Vec<SocketAddrV4> {
        self.trackers
            .get(info_hash)
            .map(|t| t.sample_peers(max))
            .unwrap_or_default()
    }

    /// Prunes every tracker and removes the ones left empty.
    pub fn prune(&mut self, now: u64, max_age: u64) {
        self.trackers.retain(|_, tracker| {
            tracker.prune(now, max_age);
            !tracker.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }
}
