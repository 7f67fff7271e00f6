//! Proposer role: originates values and reacts to how its rounds end

use tracing::{debug, info, warn};

use crate::agreement::commitment::Commitment;
use crate::agreement::types::{NodeId, Phase, RejectCause, RoundId, Settlement, SettlementKind};
use crate::error::{AgreementError, Result};

/// What the node should do after one of the proposer's rounds settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposerStep {
    /// The settled round was not ours.
    Idle,
    /// Start `round` carrying `proposal`.
    Propose { round: RoundId, proposal: String },
    /// The commitment is in place; the epoch decides when to reveal.
    AwaitReveal,
    /// The attempt is over, successful or not.
    Done,
}

#[derive(Debug)]
struct Attempt {
    phase: Phase,
    proposal: String,
    commitment: Option<Commitment>,
    round: RoundId,
    reproposals: u32,
    awaiting_reveal: bool,
}

pub struct Proposer {
    local: NodeId,
    max_reproposals: u32,
    sequence: u64,
    active: Option<Attempt>,
}

impl Proposer {
    /// Sequence numbers start at the wall clock so round ids stay unique
    /// across restarts.
    pub fn new(local: NodeId, max_reproposals: u32) -> Self {
        let sequence = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Proposer {
            local,
            max_reproposals,
            sequence,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_round(&self) -> Option<&RoundId> {
        self.active.as_ref().map(|a| &a.round)
    }

    /// Whether the running attempt is a contribution to a commit-reveal epoch.
    pub fn in_epoch(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.phase != Phase::Direct)
    }

    fn next_round(&mut self, predecessor: &str, phase: Phase) -> RoundId {
        self.sequence += 1;
        RoundId::derive(predecessor, &self.local, phase, self.sequence)
    }

    fn begin(&mut self, predecessor: &str, phase: Phase, proposal: String, commitment: Option<Commitment>) -> Result<(RoundId, String)> {
        if let Some(active) = &self.active {
            return Err(AgreementError::violation(
                &active.round,
                "a proposal attempt is already running",
            ));
        }
        let round = self.next_round(predecessor, phase);
        self.active = Some(Attempt {
            phase,
            proposal: proposal.clone(),
            commitment,
            round: round.clone(),
            reproposals: 0,
            awaiting_reveal: false,
        });
        Ok((round, proposal))
    }

    /// Propose `value` directly as the next common random.
    pub fn propose(&mut self, value: &str, predecessor: &str) -> Result<(RoundId, String)> {
        self.begin(predecessor, Phase::Direct, value.to_string(), None)
    }

    /// Publish a commitment to `value`; the value itself follows in a reveal round.
    pub fn begin_commitment(&mut self, value: &str, predecessor: &str) -> Result<(RoundId, String)> {
        let commitment = Commitment::generate(value);
        let proposal = commitment.commitment_string();
        self.begin(predecessor, Phase::Commitment, proposal, Some(commitment))
    }

    pub fn on_settled(&mut self, settlement: &Settlement) -> ProposerStep {
        let Some(attempt) = self.active.as_ref() else {
            return ProposerStep::Idle;
        };
        if attempt.round != settlement.round {
            return ProposerStep::Idle;
        }

        match &settlement.kind {
            SettlementKind::CommitmentRecorded => {
                if let Some(attempt) = self.active.as_mut() {
                    attempt.awaiting_reveal = true;
                }
                debug!(round = %settlement.round, "Proposer: commitment accepted, reveal pending");
                ProposerStep::AwaitReveal
            }
            // a reveal is bound to the epoch of its commitment
            SettlementKind::Failed(RejectCause::Superseded { authoritative })
                if attempt.reproposals < self.max_reproposals && attempt.phase != Phase::Reveal =>
            {
                let (phase, proposal, reproposals) =
                    (attempt.phase, attempt.proposal.clone(), attempt.reproposals + 1);
                let round = self.next_round(authoritative, phase);
                if let Some(attempt) = self.active.as_mut() {
                    attempt.round = round.clone();
                    attempt.reproposals = reproposals;
                }
                info!(
                    round = %round,
                    predecessor = %authoritative,
                    "Proposer: re-proposing on the authoritative common random"
                );
                ProposerStep::Propose { round, proposal }
            }
            kind => {
                if let SettlementKind::Failed(cause) = kind {
                    warn!(round = %settlement.round, cause = %cause, "Proposer: attempt failed");
                }
                self.active = None;
                ProposerStep::Done
            }
        }
    }

    /// Open the reveal round of a session whose commitment was accepted.
    pub fn reveal(&mut self, predecessor: &str) -> Option<(RoundId, String)> {
        let ready = self
            .active
            .as_ref()
            .is_some_and(|a| a.awaiting_reveal && a.commitment.is_some());
        if !ready {
            return None;
        }
        let round = self.next_round(predecessor, Phase::Reveal);
        let attempt = self.active.as_mut()?;
        let reveal = attempt.commitment.as_ref()?.reveal_string();
        attempt.phase = Phase::Reveal;
        attempt.proposal = reveal.clone();
        attempt.round = round.clone();
        attempt.reproposals = 0;
        attempt.awaiting_reveal = false;
        Some((round, reveal))
    }

    /// Drop the running attempt, returning the round it was on.
    pub fn abandon(&mut self) -> Option<RoundId> {
        self.active.take().map(|a| a.round)
    }
}
