//! 160-bit node identifiers and the XOR closeness order.

use crate::error::DhtError;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::fmt;

/// A 160-bit identifier: a node id, an info-hash, or a bucket boundary.
///
/// Identifiers have a byte-wise total order, but distance-related decisions
/// always go through [`NodeId::closer`], which orders two ids by their XOR
/// distance to a target without materializing the distances.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const LEN: usize = 20;

    /// The all-zero identifier, used as "responder unknown" on pings.
    pub const ZERO: NodeId = NodeId([0u8; 20]);

    /// The all-ones identifier, the upper bound of the full id space.
    pub const MAX: NodeId = NodeId([0xFF; 20]);

    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Digests arbitrary bytes (a keyword, a torrent info dict) into an id.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != Self::LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// True iff `a` is strictly closer to `self` (the target) than `b`.
    ///
    /// Scans most-significant byte first; at the first position where the
    /// XOR-to-target bytes differ, the smaller one wins. Equal ids are not
    /// closer than themselves.
    pub fn closer(&self, a: &NodeId, b: &NodeId) -> bool {
        for i in 0..Self::LEN {
            if a.0[i] != b.0[i] {
                return (a.0[i] ^ self.0[i]) < (b.0[i] ^ self.0[i]);
            }
        }
        false
    }

    /// The id with the lowest bit flipped; a refresh target guaranteed to
    /// land in our own bucket without being our own id.
    pub fn flip_low_bit(&self) -> Self {
        let mut id = self.0;
        id[Self::LEN - 1] ^= 1;
        Self(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
