//! Correlation of outstanding RPCs with their expected responses.
//!
//! Every outbound query carries a single-byte tag unique among pending
//! transactions to the same destination address; a response is matched by
//! (source IP, tag). Two deadlines govern each transaction: search-type
//! queries get an optional quick timeout whose expiry only stalls the
//! transaction (releasing a search concurrency unit), while the hard
//! timeout finalizes it as failed.

use crate::error::DhtError;
use crate::id::NodeId;
use crate::search::SearchId;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Query retransmissions allowed before a hard timeout is final.
pub const DEFAULT_RETRIES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl RpcKind {
    pub fn method(&self) -> &'static str {
        match self {
            RpcKind::Ping => "ping",
            RpcKind::FindNode => "find_node",
            RpcKind::GetPeers => "get_peers",
            RpcKind::AnnouncePeer => "announce_peer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: RpcKind,
    /// Expected responder; [`NodeId::ZERO`] when the peer is not yet known.
    pub node_id: NodeId,
    pub addr: SocketAddrV4,
    pub tag: u8,
    /// Epoch-seconds deadline after which the transaction stalls.
    pub quick_deadline: Option<u64>,
    /// Epoch-seconds deadline after which the transaction fails.
    pub hard_deadline: u64,
    pub retries: u8,
    pub stalled: bool,
    /// Owning search, if this query was issued by a lookup.
    pub search: Option<SearchId>,
    /// Target id or info-hash carried by find_node/get_peers/announce_peer.
    pub target: Option<NodeId>,
    /// Anti-spoof token for announce_peer.
    pub token: Option<Bytes>,
}

/// Key uniquely identifying a pending transaction.
pub type TxKey = (Ipv4Addr, u8);

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    pending: BTreeMap<TxKey, Transaction>,
}

/// Transactions surfaced by a sweep pass.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Past their quick timeout, still awaiting the hard one.
    pub stalled: Vec<Transaction>,
    /// Past their hard timeout, removed from the registry.
    pub expired: Vec<Transaction>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transaction`, assigning it a tag free for its destination.
    ///
    /// Tags are probed starting from a random value so concurrent queries to
    /// one address stay unpredictable. With all 256 tags in flight to the
    /// same address the transaction is rejected.
    pub fn register(&mut self, mut transaction: Transaction) -> Result<u8, DhtError> {
        let ip = *transaction.addr.ip();
        let start: u8 = rand::random();
        for offset in 0..=u8::MAX {
            let tag = start.wrapping_add(offset);
            if !self.pending.contains_key(&(ip, tag)) {
                transaction.tag = tag;
                self.pending.insert((ip, tag), transaction);
                return Ok(tag);
            }
        }
        Err(DhtError::TransactionExhausted)
    }

    pub fn lookup(&self, ip: Ipv4Addr, tag: u8) -> Option<&Transaction> {
        self.pending.get(&(ip, tag))
    }

    /// Completes a transaction, removing it from the registry.
    pub fn remove(&mut self, ip: Ipv4Addr, tag: u8) -> Option<Transaction> {
        self.pending.remove(&(ip, tag))
    }

    /// True when any transaction to `addr` is already pending. Keeps the
    /// maintenance pass from double-pinging one node.
    pub fn has_pending(&self, addr: &SocketAddrV4) -> bool {
        let ip = *addr.ip();
        self.pending
            .range((ip, 0)..=(ip, u8::MAX))
            .any(|(_, tx)| tx.addr == *addr)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes every transaction belonging to `search`.
    pub fn cancel_search(&mut self, search: SearchId) -> Vec<Transaction> {
        let keys: Vec<TxKey> = self
            .pending
            .iter()
            .filter(|(_, tx)| tx.search == Some(search))
            .map(|(k, _)| *k)
            .collect();
        keys.iter()
            .filter_map(|k| self.pending.remove(k))
            .collect()
    }

    /// Advances timeout state for every pending transaction.
    ///
    /// Quick-timeout expiry marks the transaction stalled exactly once and
    /// reports it; hard-timeout expiry removes and reports it.
    pub fn sweep(&mut self, now: u64) -> Sweep {
        let mut result = Sweep::default();
        let mut expired_keys = Vec::new();
        for (key, tx) in self.pending.iter_mut() {
            if now >= tx.hard_deadline {
                expired_keys.push(*key);
                continue;
            }
            if !tx.stalled && tx.quick_deadline.is_some_and(|d| now >= d) {
                tx.stalled = true;
                result.stalled.push(tx.clone());
            }
        }
        for key in expired_keys {
            if let Some(tx) = self.pending.remove(&key) {
                result.expired.push(tx);
            }
        }
        result
    }
}
