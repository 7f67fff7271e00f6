//! Multi-contributor commit-reveal epoch
//!
//! Every participant commits to a random contribution on the same
//! predecessor, then reveals it. Once the reveal phase is over the node
//! combines the contributions whose reveal matched the commitment. Fewer
//! than `(2n+1)/3` verified contributions yield no new common random.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::agreement::commitment::verify_reveal_string;
use crate::agreement::types::NodeId;

/// Hex characters kept from the combined digest.
const COMBINED_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct Epoch {
    predecessor: String,
    commitments: HashMap<NodeId, String>,
    /// Verified contributions, ordered by contributor.
    reveals: BTreeMap<NodeId, String>,
    sealed: bool,
}

impl Epoch {
    pub fn new(predecessor: impl Into<String>) -> Self {
        Epoch {
            predecessor: predecessor.into(),
            commitments: HashMap::new(),
            reveals: BTreeMap::new(),
            sealed: false,
        }
    }

    pub fn predecessor(&self) -> &str {
        &self.predecessor
    }

    /// End the commit phase. Later commitments are refused.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn commitment_of(&self, contributor: &NodeId) -> Option<&str> {
        self.commitments.get(contributor).map(String::as_str)
    }

    /// Returns false once sealed or when `contributor` already committed.
    pub fn record_commitment(&mut self, contributor: &NodeId, commitment: String) -> bool {
        if self.sealed || self.commitments.contains_key(contributor) {
            return false;
        }
        self.commitments.insert(contributor.clone(), commitment);
        true
    }

    /// Verify `reveal` against the contributor's commitment and keep the
    /// revealed value. Only the first matching reveal counts.
    pub fn record_reveal(&mut self, contributor: &NodeId, reveal: &str) -> Option<String> {
        let commitment = self.commitments.get(contributor)?;
        let value = verify_reveal_string(commitment, reveal)?.to_string();
        self.reveals
            .entry(contributor.clone())
            .or_insert_with(|| value.clone());
        Some(value)
    }

    pub fn verified(&self) -> usize {
        self.reveals.len()
    }

    /// The new common random, or the number of verified contributions when
    /// they fall short of `critical_mass`.
    pub fn combine(&self, critical_mass: usize) -> Result<String, usize> {
        if self.reveals.is_empty() || self.reveals.len() < critical_mass {
            return Err(self.reveals.len());
        }
        Ok(combine_values(&self.reveals))
    }
}

/// Digest of every contribution in contributor order. Any single honest
/// contribution makes the result unpredictable.
pub fn combine_values(reveals: &BTreeMap<NodeId, String>) -> String {
    let mut hasher = Sha256::new();
    for (contributor, value) in reveals {
        hasher.update(contributor.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..COMBINED_LEN].to_string()
}
