//! Quorum thresholds and timeout policy

use std::time::Duration;

use crate::agreement::types::ProtocolVariant;

/// Thresholds derived from the number of participants (including self).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    participants: usize,
}

impl QuorumPolicy {
    pub fn new(participants: usize) -> Self {
        QuorumPolicy { participants }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// `n/2 + 1`
    pub fn majority(&self) -> usize {
        self.participants / 2 + 1
    }

    /// `ceil(2n/3)`
    pub fn two_third_quorum(&self) -> usize {
        (2 * self.participants + 2) / 3
    }

    /// Number of faulty participants tolerated: the largest `f` with `3f < n`.
    pub fn faulty(&self) -> usize {
        self.participants.saturating_sub(1) / 3
    }

    /// WEAK messages needed (strictly more than this) to strong-accept.
    pub fn quorum_strong(&self) -> usize {
        (self.participants + self.faulty()) / 2
    }

    /// WEAK messages needed (strictly more than this) to decide directly.
    pub fn quorum_decide_weak(&self) -> usize {
        (self.participants + 3 * self.faulty()) / 2
    }

    /// STRONG messages needed (strictly more than this) to decide.
    pub fn quorum_decide_strong(&self) -> usize {
        2 * self.faulty()
    }

    /// Verified reveals an epoch needs to produce a common random: `(2n+1)/3`.
    pub fn critical_mass(&self) -> usize {
        (2 * self.participants + 1) / 3
    }
}

/// Timeout knobs. Every phase is bounded so a stalled round is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPolicy {
    /// Bounds the commit and the reveal phase of an epoch.
    pub phase_timeout: Duration,
    /// Wait between sealing the commitments and revealing.
    pub inter_phase_gap: Duration,
    /// Bounds a whole round end-to-end.
    pub round_timeout: Duration,
    /// Bounds a single Paxos ballot before it is frozen.
    pub ballot_timeout: Duration,
    /// Wait after startup before the node may initiate rounds.
    pub passive_phase: Duration,
}

impl TimingPolicy {
    pub fn for_variant(variant: ProtocolVariant) -> Self {
        let round_timeout = match variant {
            ProtocolVariant::Echo => Duration::from_secs(65),
            ProtocolVariant::Paxos => Duration::from_secs(30),
        };
        TimingPolicy {
            phase_timeout: Duration::from_secs(100),
            inter_phase_gap: Duration::from_secs(25),
            round_timeout,
            ballot_timeout: Duration::from_secs(10),
            passive_phase: Duration::from_secs(60),
        }
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::for_variant(ProtocolVariant::Echo)
    }
}
