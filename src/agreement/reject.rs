//! Reject vote accounting for a proposer's round

use std::collections::HashMap;

use crate::agreement::types::NodeId;

/// What the collected rejects say about the round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectVerdict {
    Pending,
    /// A quorum of rejects cites the same common random.
    Superseded(String),
    /// A quorum rejected, but no cited value holds a quorum.
    NoMajority,
}

/// Collects REJECTs against one proposal, bucketed by the common random
/// each rejecting peer believes is authoritative.
#[derive(Debug, Clone)]
pub struct RejectManager {
    proposal: String,
    quorum: usize,
    votes: HashMap<NodeId, String>,
}

impl RejectManager {
    pub fn new(proposal: impl Into<String>, quorum: usize) -> Self {
        RejectManager {
            proposal: proposal.into(),
            quorum,
            votes: HashMap::new(),
        }
    }

    /// Record a reject. Returns false for duplicates and rejects of other proposals.
    pub fn add(&mut self, sender: &NodeId, proposal: &str, cited: &str) -> bool {
        if proposal != self.proposal || self.votes.contains_key(sender) {
            return false;
        }
        self.votes.insert(sender.clone(), cited.to_string());
        true
    }

    pub fn count(&self) -> usize {
        self.votes.len()
    }

    pub fn has_voted(&self, sender: &NodeId) -> bool {
        self.votes.contains_key(sender)
    }

    fn buckets(&self) -> HashMap<&str, usize> {
        let mut buckets = HashMap::new();
        for cited in self.votes.values() {
            *buckets.entry(cited.as_str()).or_insert(0) += 1;
        }
        buckets
    }

    /// Largest bucket of rejects citing the same value. Ties go to the
    /// lexicographically smallest value so every node picks the same one.
    pub fn largest_bucket(&self) -> Option<(String, usize)> {
        self.buckets()
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(value, count)| (value.to_string(), count))
    }

    /// The cited value backed by a quorum, if any.
    pub fn authoritative(&self) -> Option<String> {
        self.largest_bucket()
            .filter(|(_, count)| *count >= self.quorum)
            .map(|(value, _)| value)
    }

    /// Whether any cited value can still reach a quorum if every peer not
    /// yet heard from (`remaining`) rejected in its favour.
    pub fn majority_reachable(&self, remaining: usize) -> bool {
        let largest = self.largest_bucket().map(|(_, c)| c).unwrap_or(0);
        largest + remaining >= self.quorum
    }

    /// Whether the reject count itself can still reach a quorum.
    pub fn quorum_reachable(&self, remaining: usize) -> bool {
        self.count() + remaining >= self.quorum
    }

    pub fn verdict(&self) -> RejectVerdict {
        if let Some(value) = self.authoritative() {
            return RejectVerdict::Superseded(value);
        }
        if self.count() >= self.quorum {
            return RejectVerdict::NoMajority;
        }
        RejectVerdict::Pending
    }
}
