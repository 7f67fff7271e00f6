//! Common types shared by the agreement engines, the registry and the node

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::agreement::message::Payload;

/// Identity of an InfoService taking part in the agreement.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

/// Which agreement protocol a node runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    /// Echo broadcast: INIT, ECHO, COMMIT, CONFIRMATION, REJECT
    Echo,
    /// Paxos at war: PROPOSE, WEAK, STRONG, DECIDE, FREEZE, FREEZEPROOF, COLLECT, REJECT
    Paxos,
}

impl std::str::FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "echo" => Ok(ProtocolVariant::Echo),
            "paxos" => Ok(ProtocolVariant::Paxos),
            other => Err(format!("unknown protocol variant '{}'", other)),
        }
    }
}

/// Position of a round inside a proposal attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The proposal is the new common random itself.
    Direct,
    /// The proposal is a commitment string.
    Commitment,
    /// The proposal is the reveal string for an earlier commitment.
    Reveal,
    /// A node closing its commit-reveal epoch. Never carried by a message.
    Close,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Direct => "direct",
            Phase::Commitment => "commit",
            Phase::Reveal => "reveal",
            Phase::Close => "close",
        };
        f.write_str(name)
    }
}

/// Identifier shared by every message of one agreement attempt.
///
/// Derived from the common random the initiator believed current, the
/// initiator itself and a per-initiator sequence number, so two correct
/// nodes never reuse one for different attempts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoundId {
    predecessor: String,
    initiator: NodeId,
    phase: Phase,
    sequence: u64,
}

impl RoundId {
    pub fn derive(predecessor: &str, initiator: &NodeId, phase: Phase, sequence: u64) -> Self {
        RoundId {
            predecessor: predecessor.to_string(),
            initiator: initiator.clone(),
            phase,
            sequence,
        }
    }

    /// The common random this round claims to follow.
    pub fn predecessor(&self) -> &str {
        &self.predecessor
    }

    pub fn initiator(&self) -> &NodeId {
        &self.initiator
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.predecessor, self.initiator, self.phase, self.sequence
        )
    }
}

/// Why a round ended without committing a value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RejectCause {
    /// The proposal named a predecessor this node does not hold.
    StalePredecessor,
    /// A quorum of rejects cited the same, different common random.
    Superseded { authoritative: String },
    /// A quorum rejected but no cited value reached a quorum.
    NoMajority,
    /// Neither a commit nor a reject verdict can be reached any more.
    QuorumUnreachable,
    Timeout,
    /// Paxos decided on "no value".
    NullDecision,
    /// A reveal did not match the recorded commitment.
    RevealMismatch,
    /// The commit phase of the epoch was over, or the initiator had
    /// already committed in it.
    CommitmentRefused,
    /// Too few contributions were revealed to combine a new common random.
    TooFewReveals { verified: usize, required: usize },
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectCause::StalePredecessor => f.write_str("stale predecessor"),
            RejectCause::Superseded { authoritative } => {
                write!(f, "superseded by {}", authoritative)
            }
            RejectCause::NoMajority => f.write_str("no majority among rejects"),
            RejectCause::QuorumUnreachable => f.write_str("quorum unreachable"),
            RejectCause::Timeout => f.write_str("timeout"),
            RejectCause::NullDecision => f.write_str("null decision"),
            RejectCause::RevealMismatch => f.write_str("reveal mismatch"),
            RejectCause::CommitmentRefused => f.write_str("commitment refused"),
            RejectCause::TooFewReveals { verified, required } => {
                write!(f, "{} reveals verified, {} required", verified, required)
            }
        }
    }
}

/// Terminal outcome of one round as decided by its engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed(String),
    Rejected(RejectCause),
}

/// Acceptor state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    ProposalReceived,
    Collecting,
    Decided(Outcome),
    Retired,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Decided(_) | EngineState::Retired)
    }
}

/// What the local node holds when one of its engines processes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeView<'a> {
    /// The node's current common random.
    pub common_random: &'a str,
    /// False once the node vouched for another direct round on the same
    /// predecessor.
    pub may_endorse: bool,
}

impl<'a> NodeView<'a> {
    pub fn new(common_random: &'a str) -> Self {
        NodeView {
            common_random,
            may_endorse: true,
        }
    }

    pub fn endorsing(mut self, may_endorse: bool) -> Self {
        self.may_endorse = may_endorse;
        self
    }

    /// Whether the node may vouch for a first-phase value of `round`.
    pub fn may_vouch_for(&self, round: &RoundId) -> bool {
        self.may_endorse && round.predecessor() == self.common_random
    }
}

/// Timers an engine can arm. At most one of each kind is live per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bounds the whole round.
    Round,
    /// Bounds a single Paxos ballot.
    Ballot(u32),
}

/// Instruction returned by an engine. Engines never perform I/O themselves.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send to one participant (possibly the local node).
    Send(NodeId, Payload),
    /// Send to every participant including the local node.
    Multicast(Payload),
    ArmTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    Decide(Outcome),
}

/// What a decided round did to the node's common random.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementKind {
    /// A new common random was adopted.
    Agreed,
    /// A commitment was recorded; the value follows in a reveal round.
    CommitmentRecorded,
    /// A reveal matched its commitment and counts toward the epoch.
    RevealRecorded,
    /// The round produced no new value.
    Failed(RejectCause),
}

/// Result of retiring a decided round, handed to the proposer and the listener.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub round: RoundId,
    pub kind: SettlementKind,
    pub old_common_random: String,
    pub new_common_random: Option<String>,
    /// Common random held by the node once the round is retired.
    pub current_common_random: String,
    /// Whether the agreement consumer was notified about this round.
    pub notified: bool,
}
