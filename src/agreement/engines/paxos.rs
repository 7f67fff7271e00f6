//! Paxos-at-war agreement engine
//!
//! Ballot 0 is led by the initiator, which multicasts PROPOSE. Values move
//! through weak and strong acceptance:
//!
//! - more than `f` WEAK for a value: weak-accept it
//! - more than `(n+f)/2` WEAK: strong-accept it
//! - more than `(n+3f)/2` WEAK, more than `2f` STRONG or more than `f`
//!   DECIDE: decide it
//!
//! A ballot that stalls is frozen. Once more than `2f` participants froze,
//! each sends a FREEZEPROOF of what it accepted so far to the next leader,
//! which computes the only value that is still safe ("good") and
//! multicasts it in a COLLECT together with the proofs. Deciding on no
//! value is allowed and yields no new common random.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::agreement::codec::Envelope;
use crate::agreement::engines::EngineParams;
use crate::agreement::message::{Payload, SignedMessage};
use crate::agreement::quorum::QuorumPolicy;
use crate::agreement::reject::{RejectManager, RejectVerdict};
use crate::agreement::traits::AgreementEngine;
use crate::agreement::types::{
    EngineState, Effect, NodeId, NodeView, Outcome, RejectCause, RoundId, TimerKind,
};
use crate::error::{AgreementError, Result};

type Value = Option<String>;

#[derive(Debug, Clone)]
struct FreezeProof {
    sender: NodeId,
    sealed: SignedMessage,
    weak: Value,
    strong: Value,
}

#[derive(Debug, Default)]
struct Ballot {
    weak: HashMap<NodeId, Value>,
    strong: HashMap<NodeId, Value>,
    decide: HashMap<NodeId, Value>,
    freeze: HashSet<NodeId>,
    /// Freeze proofs describing this ballot, in arrival order.
    proofs: Vec<FreezeProof>,
    weak_sent: bool,
    strong_sent: bool,
    frozen: bool,
    aborted: bool,
    collected: bool,
}

fn votes_for(votes: &HashMap<NodeId, Value>, value: &Value) -> usize {
    votes.values().filter(|v| *v == value).count()
}

pub struct PaxosEngine {
    round: RoundId,
    local: NodeId,
    participants: Vec<NodeId>,
    quorum: QuorumPolicy,
    ballot_timeout: Duration,
    state: EngineState,
    ballots: BTreeMap<u32, Ballot>,
    current: u32,
    /// Latest weakly and strongly accepted values, reported in freeze proofs.
    weak_value: Value,
    strong_value: Value,
    timer_armed: bool,
    decide_sent: bool,
    joined: bool,
    rejects: Option<RejectManager>,
}

impl PaxosEngine {
    pub fn new(params: EngineParams) -> Self {
        let quorum = QuorumPolicy::new(params.participants.len());
        PaxosEngine {
            round: params.round,
            local: params.local,
            participants: params.participants,
            quorum,
            ballot_timeout: params.ballot_timeout,
            state: EngineState::Idle,
            ballots: BTreeMap::new(),
            current: 0,
            weak_value: None,
            strong_value: None,
            timer_armed: false,
            decide_sent: false,
            joined: false,
            rejects: None,
        }
    }

    fn f(&self) -> usize {
        self.quorum.faulty()
    }

    /// Leaders rotate over the sorted participants starting at the initiator.
    fn leader(&self, ballot: u32) -> Option<&NodeId> {
        let start = self
            .participants
            .iter()
            .position(|p| p == self.round.initiator())?;
        let index = (start + ballot as usize) % self.participants.len();
        self.participants.get(index)
    }

    fn ballot(&mut self, ballot: u32) -> &mut Ballot {
        self.ballots.entry(ballot).or_default()
    }

    fn ensure_timer(&mut self, effects: &mut Vec<Effect>) {
        if !self.timer_armed {
            self.timer_armed = true;
            effects.push(Effect::ArmTimer(TimerKind::Ballot(self.current), self.ballot_timeout));
        }
    }

    fn conclude(&mut self, outcome: Outcome) -> Vec<Effect> {
        debug!(round = %self.round, outcome = ?outcome, "Paxos: decided");
        self.state = EngineState::Decided(outcome.clone());
        vec![
            Effect::CancelTimer(TimerKind::Ballot(self.current)),
            Effect::CancelTimer(TimerKind::Round),
            Effect::Decide(outcome),
        ]
    }

    fn weak_accept(&mut self, ballot: u32, value: Value) -> Vec<Effect> {
        let b = self.ballot(ballot);
        if b.weak_sent || b.frozen {
            return Vec::new();
        }
        b.weak_sent = true;
        self.weak_value = value.clone();
        self.joined = true;
        self.state = EngineState::Collecting;
        vec![Effect::Multicast(Payload::Weak { ballot, value })]
    }

    fn strong_accept(&mut self, ballot: u32, value: Value) -> Vec<Effect> {
        let b = self.ballot(ballot);
        if b.strong_sent || b.frozen {
            return Vec::new();
        }
        b.strong_sent = true;
        self.strong_value = value.clone();
        self.joined = true;
        vec![Effect::Multicast(Payload::Strong { ballot, value })]
    }

    fn decide_value(&mut self, ballot: u32, value: Value) -> Vec<Effect> {
        if self.decide_sent {
            return Vec::new();
        }
        self.decide_sent = true;
        self.joined = true;
        info!(round = %self.round, ballot, value = ?value, "Paxos: value decided");
        let mut effects = vec![Effect::Multicast(Payload::Decide {
            ballot,
            value: value.clone(),
        })];
        let outcome = match value {
            Some(v) => Outcome::Committed(v),
            None => Outcome::Rejected(RejectCause::NullDecision),
        };
        effects.extend(self.conclude(outcome));
        effects
    }

    fn freeze(&mut self, ballot: u32) -> Vec<Effect> {
        let b = self.ballot(ballot);
        if b.frozen || b.aborted {
            return Vec::new();
        }
        b.frozen = true;
        self.joined = true;
        debug!(round = %self.round, ballot, "Paxos: freezing ballot");
        vec![Effect::Multicast(Payload::Freeze { ballot })]
    }

    fn abort(&mut self, ballot: u32) -> Vec<Effect> {
        self.ballot(ballot).aborted = true;
        let next = ballot + 1;
        let mut effects = vec![Effect::CancelTimer(TimerKind::Ballot(ballot))];
        if next > self.current {
            self.current = next;
            effects.push(Effect::ArmTimer(TimerKind::Ballot(next), self.ballot_timeout));
        }
        if let Some(leader) = self.leader(next).cloned() {
            debug!(round = %self.round, ballot, leader = %leader, "Paxos: ballot aborted, sending freeze proof");
            effects.push(Effect::Send(
                leader,
                Payload::FreezeProof {
                    ballot,
                    weak_value: self.weak_value.clone(),
                    strong_value: self.strong_value.clone(),
                },
            ));
        }
        effects
    }

    fn on_propose(&mut self, sender: &NodeId, ballot: u32, proposal: &str, view: NodeView<'_>) -> Result<Vec<Effect>> {
        let common_random = view.common_random;
        if ballot != 0 || sender != self.round.initiator() {
            return Err(AgreementError::violation(&self.round, "PROPOSE must come from the initiator in ballot 0"));
        }
        if self.round.predecessor() != common_random {
            debug!(round = %self.round, ours = %common_random, "Paxos: proposal names a stale predecessor, rejecting");
            self.state = EngineState::Decided(Outcome::Rejected(RejectCause::StalePredecessor));
            return Ok(vec![
                Effect::Send(
                    self.round.initiator().clone(),
                    Payload::Reject {
                        proposal: proposal.to_string(),
                        last_common_random: common_random.to_string(),
                    },
                ),
                Effect::Decide(Outcome::Rejected(RejectCause::StalePredecessor)),
            ]);
        }
        if self.state == EngineState::Idle {
            self.state = EngineState::ProposalReceived;
        }
        if !view.may_endorse {
            debug!(round = %self.round, "Paxos: endorsement held by a concurrent round, not accepting");
            return Ok(Vec::new());
        }
        Ok(self.weak_accept(0, Some(proposal.to_string())))
    }

    /// Ballot 0 carries the initiator's own value, so accepting it is only
    /// sound on the predecessor this node holds and while no concurrent
    /// round on it was vouched for. Later ballots carry a proven value.
    fn may_accept(&self, ballot: u32, view: NodeView<'_>) -> bool {
        ballot > 0 || view.may_vouch_for(&self.round)
    }

    fn on_weak(&mut self, sender: &NodeId, ballot: u32, value: Value, view: NodeView<'_>) -> Vec<Effect> {
        let (count, frozen) = {
            let b = self.ballot(ballot);
            if b.aborted || b.weak.contains_key(sender) {
                return Vec::new();
            }
            b.weak.insert(sender.clone(), value.clone());
            (votes_for(&b.weak, &value), b.frozen)
        };
        let mut effects = Vec::new();
        if frozen {
            return effects;
        }
        if self.may_accept(ballot, view) {
            if count > self.f() {
                effects.extend(self.weak_accept(ballot, value.clone()));
            }
            if count > self.quorum.quorum_strong() {
                effects.extend(self.strong_accept(ballot, value.clone()));
            }
        } else if count > self.f() {
            debug!(round = %self.round, ballot, "Paxos: not accepting a value for a foreign or locked predecessor");
        }
        if count > self.quorum.quorum_decide_weak() {
            effects.extend(self.decide_value(ballot, value));
        }
        effects
    }

    fn on_strong(&mut self, sender: &NodeId, ballot: u32, value: Value) -> Vec<Effect> {
        let count = {
            let b = self.ballot(ballot);
            if b.aborted || b.strong.contains_key(sender) {
                return Vec::new();
            }
            b.strong.insert(sender.clone(), value.clone());
            votes_for(&b.strong, &value)
        };
        if count > self.quorum.quorum_decide_strong() {
            return self.decide_value(ballot, value);
        }
        Vec::new()
    }

    fn on_decide(&mut self, sender: &NodeId, ballot: u32, value: Value) -> Vec<Effect> {
        let count = {
            let b = self.ballot(ballot);
            if b.decide.contains_key(sender) {
                return Vec::new();
            }
            b.decide.insert(sender.clone(), value.clone());
            votes_for(&b.decide, &value)
        };
        if count > self.f() {
            return self.decide_value(ballot, value);
        }
        Vec::new()
    }

    fn on_freeze(&mut self, sender: &NodeId, ballot: u32) -> Vec<Effect> {
        let f = self.f();
        let count = {
            let b = self.ballot(ballot);
            if b.aborted || !b.freeze.insert(sender.clone()) {
                return Vec::new();
            }
            b.freeze.len()
        };
        let mut effects = Vec::new();
        if count > f {
            effects.extend(self.freeze(ballot));
        }
        let b = self.ballot(ballot);
        if count > 2 * f && b.frozen && !b.aborted {
            effects.extend(self.abort(ballot));
        }
        effects
    }

    fn on_freeze_proof(&mut self, envelope: &Envelope, ballot: u32, weak: Value, strong: Value) -> Result<Vec<Effect>> {
        let next = ballot + 1;
        if self.leader(next) != Some(&self.local) {
            return Err(AgreementError::violation(&self.round, "FREEZEPROOF sent to a non-leader"));
        }
        let sender = envelope.message.sender.clone();
        let threshold = 2 * self.f();
        let ready = {
            let b = self.ballot(ballot);
            if b.proofs.iter().any(|p| p.sender == sender) {
                return Ok(Vec::new());
            }
            b.proofs.push(FreezeProof {
                sender,
                sealed: envelope.sealed.clone(),
                weak,
                strong,
            });
            b.proofs.len() > threshold
        };
        if !ready || self.ballot(next).collected {
            return Ok(Vec::new());
        }
        self.ballot(next).collected = true;
        let value = self.good_value(next);
        let proofs = self.ballot(ballot).proofs.iter().map(|p| p.sealed.clone()).collect();
        info!(round = %self.round, ballot = next, value = ?value, "Paxos: leading ballot, sending COLLECT");
        Ok(vec![Effect::Multicast(Payload::Collect {
            ballot: next,
            value,
            proofs,
        })])
    }

    fn on_collect(&mut self, envelope: &Envelope, ballot: u32, value: Value) -> Result<Vec<Effect>> {
        if ballot == 0 || self.leader(ballot) != Some(&envelope.message.sender) {
            return Err(AgreementError::violation(&self.round, "COLLECT not sent by the ballot leader"));
        }
        let previous = ballot - 1;
        let proofs = self.validate_proofs(previous, envelope)?;
        {
            // a COLLECT proves more than 2f participants gave up on `previous`
            let b = self.ballot(previous);
            b.frozen = true;
            b.aborted = true;
            for proof in proofs {
                if !b.proofs.iter().any(|p| p.sender == proof.sender) {
                    b.proofs.push(proof);
                }
            }
        }
        let good = self.good_value(ballot);
        if good != value {
            return Err(AgreementError::violation(
                &self.round,
                format!("COLLECT value {:?} is not good, expected {:?}", value, good),
            ));
        }

        let mut effects = Vec::new();
        if ballot > self.current {
            effects.push(Effect::CancelTimer(TimerKind::Ballot(self.current)));
            self.current = ballot;
            self.timer_armed = true;
            effects.push(Effect::ArmTimer(TimerKind::Ballot(ballot), self.ballot_timeout));
        }
        self.ballot(ballot).collected = true;
        effects.extend(self.weak_accept(ballot, value));
        Ok(effects)
    }

    /// COLLECT must embed more than `2f` distinct freeze proofs of the
    /// previous ballot of this round.
    fn validate_proofs(&self, ballot: u32, envelope: &Envelope) -> Result<Vec<FreezeProof>> {
        let sealed_proofs = envelope.message.payload.embedded();
        let mut proofs: Vec<FreezeProof> = Vec::new();
        for (message, sealed) in envelope.embedded.iter().zip(sealed_proofs) {
            let Payload::FreezeProof {
                ballot: b,
                weak_value,
                strong_value,
            } = &message.payload
            else {
                return Err(AgreementError::violation(&self.round, "COLLECT holds a non-FREEZEPROOF"));
            };
            if *b != ballot || message.round != self.round || !self.participants.contains(&message.sender) {
                return Err(AgreementError::violation(&self.round, "COLLECT holds a foreign freeze proof"));
            }
            if proofs.iter().any(|p| p.sender == message.sender) {
                continue;
            }
            proofs.push(FreezeProof {
                sender: message.sender.clone(),
                sealed: sealed.clone(),
                weak: weak_value.clone(),
                strong: strong_value.clone(),
            });
        }
        if proofs.len() <= 2 * self.f() {
            return Err(AgreementError::violation(
                &self.round,
                format!("COLLECT holds {} freeze proofs, more than {} required", proofs.len(), 2 * self.f()),
            ));
        }
        Ok(proofs)
    }

    /// Values that may have been decided in `ballot`, judged from its proofs.
    fn possible(&self, ballot: u32) -> Vec<String> {
        let Some(b) = self.ballots.get(&ballot) else {
            return Vec::new();
        };
        let mut result: Vec<String> = Vec::new();
        let candidates = b
            .proofs
            .iter()
            .flat_map(|p| [p.weak.as_ref(), p.strong.as_ref()])
            .flatten();
        for candidate in candidates {
            if result.contains(candidate) {
                continue;
            }
            let weak = b.proofs.iter().filter(|p| p.weak.as_ref() == Some(candidate)).count();
            let strong = b.proofs.iter().filter(|p| p.strong.as_ref() == Some(candidate)).count();
            if weak > self.quorum.quorum_strong() || strong > self.f() {
                result.push(candidate.clone());
            }
        }
        result
    }

    /// The value the leader of ballot `next` must propose: the earliest
    /// possible value that no later ballot rules out, or no value at all.
    fn good_value(&self, next: u32) -> Value {
        for i in 0..next {
            for candidate in self.possible(i) {
                let consistent = (i..next).all(|j| {
                    let poss = self.possible(j);
                    poss.is_empty() || poss.contains(&candidate)
                });
                if consistent {
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn on_reject(&mut self, sender: &NodeId, proposal: &str, cited: &str) -> Result<Vec<Effect>> {
        let Some(rejects) = self.rejects.as_mut() else {
            return Err(AgreementError::violation(&self.round, "REJECT sent to a non-initiator"));
        };
        if !rejects.add(sender, proposal, cited) {
            return Ok(Vec::new());
        }
        match rejects.verdict() {
            RejectVerdict::Superseded(authoritative) => {
                Ok(self.conclude(Outcome::Rejected(RejectCause::Superseded { authoritative })))
            }
            RejectVerdict::NoMajority => Ok(self.conclude(Outcome::Rejected(RejectCause::NoMajority))),
            RejectVerdict::Pending => Ok(Vec::new()),
        }
    }
}

impl AgreementEngine for PaxosEngine {
    fn round(&self) -> &RoundId {
        &self.round
    }

    fn state(&self) -> &EngineState {
        &self.state
    }

    fn has_joined(&self) -> bool {
        self.joined
    }

    fn start(&mut self, proposal: &str) -> Vec<Effect> {
        if self.state != EngineState::Idle || &self.local != self.round.initiator() {
            return Vec::new();
        }
        self.rejects = Some(RejectManager::new(proposal, self.quorum.two_third_quorum()));
        self.joined = true;
        self.state = EngineState::ProposalReceived;
        let mut effects = Vec::new();
        self.ensure_timer(&mut effects);
        effects.push(Effect::Multicast(Payload::Propose {
            ballot: 0,
            proposal: proposal.to_string(),
        }));
        effects
    }

    fn endorsed(&self) -> bool {
        self.ballots.get(&0).is_some_and(|b| b.weak_sent)
    }

    fn handle(&mut self, envelope: &Envelope, view: NodeView<'_>) -> Result<Vec<Effect>> {
        if self.state.is_terminal() {
            return Err(AgreementError::violation(&self.round, "round already decided"));
        }
        let message = &envelope.message;
        if !self.participants.contains(&message.sender) {
            return Err(AgreementError::violation(&self.round, "sender is not a participant"));
        }
        if !envelope.signature_ok {
            debug!(round = %self.round, sender = %message.sender, "Paxos: unauthenticated message not counted");
            return Ok(Vec::new());
        }

        let mut effects = Vec::new();
        self.ensure_timer(&mut effects);
        let sender = &message.sender;
        let produced = match &message.payload {
            Payload::Propose { ballot, proposal } => {
                self.on_propose(sender, *ballot, proposal, view)?
            }
            Payload::Weak { ballot, value } => self.on_weak(sender, *ballot, value.clone(), view),
            Payload::Strong { ballot, value } => self.on_strong(sender, *ballot, value.clone()),
            Payload::Decide { ballot, value } => self.on_decide(sender, *ballot, value.clone()),
            Payload::Freeze { ballot } => self.on_freeze(sender, *ballot),
            Payload::FreezeProof {
                ballot,
                weak_value,
                strong_value,
            } => self.on_freeze_proof(envelope, *ballot, weak_value.clone(), strong_value.clone())?,
            Payload::Collect { ballot, value, .. } => self.on_collect(envelope, *ballot, value.clone())?,
            Payload::Reject {
                proposal,
                last_common_random,
            } => self.on_reject(sender, proposal, last_common_random)?,
            other => {
                return Err(AgreementError::violation(
                    &self.round,
                    format!("unexpected {} in a paxos round", other.kind()),
                ))
            }
        };
        effects.extend(produced);
        Ok(effects)
    }

    fn on_timeout(&mut self, timer: TimerKind) -> Vec<Effect> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match timer {
            TimerKind::Round => self.conclude(Outcome::Rejected(RejectCause::Timeout)),
            TimerKind::Ballot(ballot) if ballot == self.current => self.freeze(ballot),
            TimerKind::Ballot(_) => Vec::new(),
        }
    }

    fn retire(&mut self) {
        self.state = EngineState::Retired;
    }
}
