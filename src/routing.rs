//! Kademlia routing table: a binary tree of id-range buckets.
//!
//! Buckets live in an arena and are indexed by [`BucketId`]; an ordered map
//! from each bucket's upper bound finds the bucket covering any id. Splits
//! only ever happen to the bucket containing our own id, so the split-off
//! halves form a chain from the self bucket outward, ordered by how much id
//! prefix they share with us. That chain drives the closest-bucket-first
//! enumeration used to seed searches.

use crate::id::NodeId;
use crate::node::{Node, BAD_RETENTION_SECS};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use tracing::debug;

/// Replication width: nodes per bucket and per lookup result set.
pub const K: usize = 8;

/// Stable arena index of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketId(usize);

#[derive(Debug)]
pub struct Bucket {
    pub begin: NodeId,
    pub end: NodeId,
    pub nodes: Vec<Node>,
    pub good: usize,
    pub bad: usize,
    /// Epoch seconds of the last membership or health change.
    pub last_changed: u64,
    /// Chain link toward the self bucket.
    parent: Option<BucketId>,
    /// Chain link away from the self bucket.
    child: Option<BucketId>,
}

impl Bucket {
    fn new(begin: NodeId, end: NodeId, now: u64) -> Self {
        Bucket {
            begin,
            end,
            nodes: Vec::with_capacity(K),
            good: 0,
            bad: 0,
            last_changed: now,
            parent: None,
            child: None,
        }
    }

    fn contains(&self, id: &NodeId) -> bool {
        *id >= self.begin && *id <= self.end
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    fn recount(&mut self) {
        self.good = self.nodes.iter().filter(|n| n.is_good()).count();
        self.bad = self.nodes.iter().filter(|n| n.is_bad()).count();
    }
}

/// Outcome of [`RoutingTable::add_node`].
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The node was inserted, possibly after evictions or splits.
    Added,
    /// A node with this id was already present; its entry was refreshed.
    Refreshed,
    /// The target bucket is full of non-bad nodes and is not ours to split.
    Rejected,
    /// The node's id is our own, or a known id spoke from a new address.
    Ignored,
}

pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<Bucket>,
    /// Maps each bucket's upper bound to its arena slot.
    by_end: BTreeMap<NodeId, BucketId>,
    self_bucket: BucketId,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, now: u64) -> Self {
        let root = Bucket::new(NodeId::ZERO, NodeId::MAX, now);
        let mut by_end = BTreeMap::new();
        by_end.insert(NodeId::MAX, BucketId(0));
        RoutingTable {
            self_id,
            buckets: vec![root],
            by_end,
            self_bucket: BucketId(0),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn bucket(&self, id: BucketId) -> &Bucket {
        &self.buckets[id.0]
    }

    fn bucket_mut(&mut self, id: BucketId) -> &mut Bucket {
        &mut self.buckets[id.0]
    }

    /// Total nodes across all buckets.
    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// Returns the bucket whose range covers `id`.
    pub fn find_bucket(&self, id: &NodeId) -> BucketId {
        // Ranges are contiguous over the whole id space, so the first bucket
        // whose end is >= id covers it.
        *self
            .by_end
            .range(*id..)
            .next()
            .map(|(_, bucket)| bucket)
            .unwrap_or(&self.self_bucket)
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        let bucket = self.find_bucket(id);
        self.bucket(bucket).nodes.iter().find(|n| n.id == *id)
    }

    /// Looks a node up by id, verifying it still answers from `addr`.
    pub fn find_node_strict(&self, id: &NodeId, addr: &SocketAddrV4) -> Option<&Node> {
        self.find_node(id).filter(|n| n.addr == *addr)
    }

    /// True when the bucket covering `id` would accept a new node without
    /// rejecting it, or already knows this id.
    pub fn want_node(&self, id: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let bucket = self.bucket(self.find_bucket(id));
        if bucket.nodes.iter().any(|n| n.id == *id) {
            return true;
        }
        !bucket.is_full() || bucket.bad > 0 || bucket.contains(&self.self_id)
    }

    /// Inserts a node, evicting a bad resident or splitting the self bucket
    /// when the covering bucket is full.
    pub fn add_node(&mut self, node: Node, now: u64) -> AddOutcome {
        if node.id == self.self_id {
            return AddOutcome::Ignored;
        }
        loop {
            let bucket_id = self.find_bucket(&node.id);
            let bucket = self.bucket_mut(bucket_id);

            if let Some(existing) = bucket.nodes.iter_mut().find(|n| n.id == node.id) {
                // A known id claimed from a different address never rebinds
                // the recorded endpoint or resets its health.
                if existing.addr != node.addr {
                    return AddOutcome::Ignored;
                }
                existing.mark_replied(now);
                bucket.recount();
                bucket.last_changed = now;
                return AddOutcome::Refreshed;
            }

            if !bucket.is_full() {
                bucket.nodes.push(node);
                bucket.recount();
                bucket.last_changed = now;
                return AddOutcome::Added;
            }

            // Full bucket: evict a bad resident, preferring the one seen
            // longest ago.
            let evict = bucket
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.is_bad())
                .min_by_key(|(_, n)| n.last_seen)
                .map(|(i, _)| i);
            if let Some(i) = evict {
                let evicted = bucket.nodes.swap_remove(i);
                debug!(id = %evicted.id, "evicted bad node");
                bucket.recount();
                continue;
            }

            if bucket_id != self.self_bucket {
                return AddOutcome::Rejected;
            }
            self.split(bucket_id, now);
        }
    }

    /// Splits the self bucket at the arithmetic midpoint of its range.
    ///
    /// The existing bucket keeps the upper half; a new bucket takes the
    /// lower half and inherits the nodes that fall in it. Whichever half
    /// contains the self id becomes the chain head.
    fn split(&mut self, bucket_id: BucketId, now: u64) {
        let (begin, end, old_child) = {
            let b = self.bucket(bucket_id);
            (b.begin, b.end, b.child)
        };
        let mid = range_midpoint(&begin, &end);
        let upper_begin = id_successor(&mid);

        let new_id = BucketId(self.buckets.len());
        let mut lower = Bucket::new(begin, mid, now);

        {
            let upper = self.bucket_mut(bucket_id);
            upper.begin = upper_begin;
            upper.last_changed = now;
            let (low_nodes, high_nodes) =
                std::mem::take(&mut upper.nodes).into_iter().partition(|n| n.id <= mid);
            lower.nodes = low_nodes;
            upper.nodes = high_nodes;
            upper.recount();
        }
        lower.recount();
        self.buckets.push(lower);
        self.by_end.insert(mid, new_id);

        // Relink the chain so the half holding the self id stays first.
        let (head, tail) = if self.self_id <= mid {
            (new_id, bucket_id)
        } else {
            (bucket_id, new_id)
        };
        self.bucket_mut(head).parent = None;
        self.bucket_mut(head).child = Some(tail);
        self.bucket_mut(tail).parent = Some(head);
        self.bucket_mut(tail).child = old_child;
        if let Some(next) = old_child {
            self.bucket_mut(next).parent = Some(tail);
        }
        self.self_bucket = head;
        debug!(buckets = self.buckets.len(), "split self bucket");
    }

    pub fn remove_node(&mut self, id: &NodeId, now: u64) {
        let bucket_id = self.find_bucket(id);
        let bucket = self.bucket_mut(bucket_id);
        if let Some(i) = bucket.nodes.iter().position(|n| n.id == *id) {
            bucket.nodes.swap_remove(i);
            bucket.recount();
            bucket.last_changed = now;
        }
    }

    /// Records a reply from `id`, promoting its health.
    pub fn mark_good(&mut self, id: &NodeId, now: u64) {
        let bucket_id = self.find_bucket(id);
        let bucket = self.bucket_mut(bucket_id);
        if let Some(node) = bucket.nodes.iter_mut().find(|n| n.id == *id) {
            let was_good = node.is_good();
            node.mark_replied(now);
            if !was_good {
                bucket.recount();
                bucket.last_changed = now;
            }
        }
    }

    /// Records a failed expectation against `id`. Removes the node outright
    /// once it is bad and past the retention window.
    pub fn mark_failed(&mut self, id: &NodeId, now: u64) {
        let bucket_id = self.find_bucket(id);
        let bucket = self.bucket_mut(bucket_id);
        let Some(i) = bucket.nodes.iter().position(|n| n.id == *id) else {
            return;
        };
        let was_bad = bucket.nodes[i].is_bad();
        bucket.nodes[i].active = false;
        bucket.nodes[i].mark_failed();
        if bucket.nodes[i].is_bad() && bucket.nodes[i].age(now) >= BAD_RETENTION_SECS {
            bucket.nodes.swap_remove(i);
        }
        if !was_bad {
            bucket.last_changed = now;
        }
        bucket.recount();
    }

    /// Collects up to `limit` non-bad nodes, nearest buckets first.
    ///
    /// Starts at the bucket covering `target`, then walks the split chain
    /// toward the self bucket, then away from it.
    pub fn closest_nodes(&self, target: &NodeId, limit: usize) -> Vec<&Node> {
        let start = self.find_bucket(target);
        let mut order = Vec::with_capacity(self.buckets.len());
        order.push(start);
        let mut cur = self.bucket(start).parent;
        while let Some(id) = cur {
            order.push(id);
            cur = self.bucket(id).parent;
        }
        let mut cur = self.bucket(start).child;
        while let Some(id) = cur {
            order.push(id);
            cur = self.bucket(id).child;
        }

        let mut out = Vec::with_capacity(limit);
        for bucket_id in order {
            for node in &self.bucket(bucket_id).nodes {
                if out.len() >= limit {
                    return out;
                }
                if !node.is_bad() {
                    out.push(node);
                }
            }
        }
        out
    }

    /// Re-derives every node's `active` flag from its recency.
    pub fn recompute_active(&mut self, now: u64) {
        for bucket in &mut self.buckets {
            for node in &mut bucket.nodes {
                node.recompute_active(now);
            }
            bucket.recount();
        }
    }

    /// Nodes re-pinged during maintenance: everything not currently good,
    /// including bad nodes still inside the retention window. A bad node
    /// either answers and recovers or accumulates the failure that drives
    /// its retention-based removal.
    pub fn nodes_to_reping(&self) -> Vec<(NodeId, SocketAddrV4)> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_good())
            .map(|n| (n.id, n.addr))
            .collect()
    }

    /// Buckets that are under-populated or have not changed within
    /// `stale_after` seconds, each paired with a random id in its range.
    pub fn buckets_needing_refresh(&self, now: u64, stale_after: u64) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|b| b.good < K || now.saturating_sub(b.last_changed) >= stale_after)
            .map(|b| random_id_in_range(&b.begin, &b.end))
            .collect()
    }

    /// Iterates all nodes, for cache persistence.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }
}

/// Byte-wise arithmetic midpoint of an id range.
///
/// Copies `end`, then replaces the first byte where the bounds differ with
/// the average of the two. With ranges produced by repeated halving this
/// lands exactly between the bounds.
fn range_midpoint(begin: &NodeId, end: &NodeId) -> NodeId {
    let mut mid = *end;
    for i in 0..NodeId::LEN {
        if begin.0[i] != end.0[i] {
            mid.0[i] = (begin.0[i] >> 1).wrapping_add(end.0[i] >> 1);
            for byte in mid.0[i + 1..].iter_mut() {
                *byte = 0xFF;
            }
            break;
        }
    }
    mid
}

/// The id one greater than `id`, with carry. Saturates at the maximum id.
fn id_successor(id: &NodeId) -> NodeId {
    let mut next = *id;
    for byte in next.0.iter_mut().rev() {
        let (v, overflow) = byte.overflowing_add(1);
        *byte = v;
        if !overflow {
            return next;
        }
    }
    NodeId::MAX
}

/// A uniformly random id inside [begin, end], used as a refresh target.
fn random_id_in_range(begin: &NodeId, end: &NodeId) -> NodeId {
    let mut id = NodeId::generate();
    for i in 0..NodeId::LEN {
        if begin.0[i] == end.0[i] {
            id.0[i] = begin.0[i];
        } else {
            id.0[i] = rand::random_range(begin.0[i]..=end.0[i]);
            // Bytes past the first differing position may be anything when
            // the chosen byte is strictly inside the bound bytes.
            if id.0[i] > begin.0[i] && id.0[i] < end.0[i] {
                return id;
            }
            // Pinned to a bound byte: clamp the tail to stay in range.
            if id.0[i] == begin.0[i] {
                id.0[i + 1..].copy_from_slice(&begin.0[i + 1..]);
            } else {
                id.0[i + 1..].copy_from_slice(&end.0[i + 1..]);
            }
            return id;
        }
    }
    id
}
