//! Iterative bounded-concurrency lookup and the announce phase that can
//! follow it.
//!
//! A search keeps a closest-first candidate list capped at
//! [`MAX_CANDIDATES`]. Candidates move Fresh -> Pending -> Replied or
//! Failed, with Stalled in between when a quick timeout fires before the
//! hard one. Only Pending candidates occupy a concurrency unit; the lookup
//! reaches its fixed point when no Fresh candidate remains and nothing is
//! Pending.

use crate::id::NodeId;
use crate::node::Node;
use crate::routing::K;
use std::net::SocketAddrV4;

/// Upper bound on tracked candidates per search.
///
/// Trimming never drops a Pending candidate, so the list can transiently
/// hold up to [`CONCURRENCY`] entries beyond this bound until the in-flight
/// contacts resolve.
pub const MAX_CANDIDATES: usize = 18;

/// Simultaneously pending lookup transactions per search.
pub const CONCURRENCY: usize = 3;

/// Stable handle of a live search, also carried by its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchId(pub u64);

/// Receives discovered peers: (info-hash, peer endpoint).
pub type PeerCallback = Box<dyn FnMut(&NodeId, SocketAddrV4) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Fresh,
    Pending,
    Stalled,
    Replied,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub state: CandidateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Searching,
    Announcing,
}

pub struct Search {
    pub id: SearchId,
    pub target: NodeId,
    /// Candidates in closeness order, nearest to `target` first. Capped at
    /// [`MAX_CANDIDATES`] plus any Pending entries trimming must retain.
    candidates: Vec<Candidate>,
    pub phase: Phase,
    /// Candidates currently occupying a concurrency unit.
    pending: usize,
    pub contacted: usize,
    pub replied: usize,
    /// Live transactions referencing this search.
    pub tx_refs: usize,
    pub started: bool,
    restarted: bool,
    /// Publish port; present for announce-mode searches.
    pub publish_port: Option<u16>,
    pub callback: Option<PeerCallback>,
    /// Opaque caller token used for cancellation.
    pub ticket: u64,
}

impl Search {
    pub fn new(
        id: SearchId,
        target: NodeId,
        publish_port: Option<u16>,
        callback: Option<PeerCallback>,
        ticket: u64,
    ) -> Self {
        Search {
            id,
            target,
            candidates: Vec::with_capacity(MAX_CANDIDATES),
            phase: Phase::Searching,
            pending: 0,
            contacted: 0,
            replied: 0,
            tx_refs: 0,
            started: false,
            restarted: false,
            publish_port,
            callback,
            ticket,
        }
    }

    pub fn is_publish(&self) -> bool {
        self.publish_port.is_some()
    }

    /// Seeds the candidate list from the routing table's closest nodes.
    pub fn seed<'a>(&mut self, nodes: impl IntoIterator<Item = &'a Node>) {
        for node in nodes {
            self.add_candidate(node.id, node.addr);
        }
        self.started = true;
    }

    /// Merges a learned node into the candidate list at its closeness rank.
    ///
    /// Nodes already listed (by id or by endpoint) are ignored, as is
    /// anything that would rank past a full list's tail.
    pub fn add_candidate(&mut self, id: NodeId, addr: SocketAddrV4) {
        if self
            .candidates
            .iter()
            .any(|c| c.id == id || c.addr == addr)
        {
            return;
        }
        let rank = self
            .candidates
            .iter()
            .position(|c| self.target.closer(&id, &c.id))
            .unwrap_or(self.candidates.len());
        if rank >= MAX_CANDIDATES {
            return;
        }
        self.candidates.insert(
            rank,
            Candidate {
                id,
                addr,
                state: CandidateState::Fresh,
            },
        );
        if self.candidates.len() > MAX_CANDIDATES {
            self.trim(false);
        }
    }

    /// Shrinks the candidate list back to its cap.
    ///
    /// The closest entries are kept unconditionally. A Pending candidate is
    /// never dropped while its transaction is in flight. On the final pass
    /// of a publish search, Replied candidates are retained beyond their
    /// rank up to replication width so the announce set stays intact.
    pub fn trim(&mut self, final_pass: bool) {
        let keep_replied = self.is_publish();
        let mut kept = 0usize;
        let mut replied_kept = 0usize;
        let cap = if final_pass { K } else { MAX_CANDIDATES };
        self.candidates.retain(|c| {
            if c.state == CandidateState::Pending {
                kept += 1;
                return true;
            }
            if final_pass && !matches!(c.state, CandidateState::Replied) {
                return false;
            }
            if kept < cap {
                kept += 1;
                if c.state == CandidateState::Replied {
                    replied_kept += 1;
                }
                return true;
            }
            if keep_replied && c.state == CandidateState::Replied && replied_kept < K {
                kept += 1;
                replied_kept += 1;
                return true;
            }
            false
        });
    }

    /// The next candidate to contact, if a concurrency unit is free.
    pub fn next_contact(&mut self) -> Option<(NodeId, SocketAddrV4)> {
        if self.phase != Phase::Searching || self.pending >= CONCURRENCY {
            return None;
        }
        let candidate = self
            .candidates
            .iter_mut()
            .find(|c| c.state == CandidateState::Fresh)?;
        candidate.state = CandidateState::Pending;
        self.pending += 1;
        self.contacted += 1;
        Some((candidate.id, candidate.addr))
    }

    fn transition(&mut self, id: &NodeId, to: CandidateState) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.id == *id) {
            if c.state == CandidateState::Pending {
                self.pending = self.pending.saturating_sub(1);
            }
            if to == CandidateState::Replied && c.state != CandidateState::Replied {
                self.replied += 1;
            }
            c.state = to;
        }
    }

    /// Records a reply from `id`. A late reply after a stall still counts.
    pub fn node_replied(&mut self, id: &NodeId) {
        self.transition(id, CandidateState::Replied);
    }

    /// Records a quick-timeout stall, freeing the concurrency unit while
    /// the transaction awaits its hard deadline.
    pub fn node_stalled(&mut self, id: &NodeId) {
        self.transition(id, CandidateState::Stalled);
    }

    /// Records a hard failure for `id`.
    pub fn node_failed(&mut self, id: &NodeId) {
        self.transition(id, CandidateState::Failed);
    }

    /// The lookup fixed point: nothing left to contact, nothing in flight.
    pub fn is_complete(&self) -> bool {
        self.pending == 0
            && !self
                .candidates
                .iter()
                .any(|c| c.state == CandidateState::Fresh)
    }

    /// True if the search found nothing and has not yet been re-seeded.
    pub fn wants_restart(&self) -> bool {
        self.is_complete() && self.replied == 0 && !self.restarted
    }

    /// Resets candidate bookkeeping for a second seeding pass.
    pub fn restart(&mut self) {
        self.restarted = true;
        self.candidates.clear();
        self.pending = 0;
    }

    /// Fixes the replication set and enters the announce phase.
    ///
    /// Refuses while the lookup has not reached its fixed point, or when
    /// the trimmed set is still wider than the replication width. Returns
    /// the nodes to send get_peers to.
    pub fn start_announce(&mut self) -> Vec<(NodeId, SocketAddrV4)> {
        if self.phase != Phase::Searching || !self.is_complete() {
            return Vec::new();
        }
        self.trim(true);
        if self.candidates.len() > K {
            return Vec::new();
        }
        self.phase = Phase::Announcing;
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Replied)
            .map(|c| (c.id, c.addr))
            .collect()
    }

    #[cfg(test)]
    fn candidate_ids(&self) -> Vec<NodeId> {
        self.candidates.iter().map(|c| c.id).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.candidates.len()
    }
}

#[cfg(test)]
mod tests;
