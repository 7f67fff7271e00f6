//! Echo-broadcast agreement engine
//!
//! The initiator multicasts INIT; each participant holding the claimed
//! predecessor echoes it back, otherwise it answers with a REJECT citing
//! its own common random. With a two-third quorum of signed echoes the
//! initiator multicasts COMMIT carrying them as proof, and every other
//! participant relays a CONFIRMATION with the same proof.

use std::collections::HashSet;
use tracing::debug;

use crate::agreement::codec::Envelope;
use crate::agreement::engines::EngineParams;
use crate::agreement::message::{Message, Payload, SignedMessage};
use crate::agreement::quorum::QuorumPolicy;
use crate::agreement::reject::{RejectManager, RejectVerdict};
use crate::agreement::traits::AgreementEngine;
use crate::agreement::types::{
    EngineState, Effect, NodeId, NodeView, Outcome, RejectCause, RoundId, TimerKind,
};
use crate::error::{AgreementError, Result};

pub struct EchoEngine {
    round: RoundId,
    local: NodeId,
    participants: Vec<NodeId>,
    quorum: QuorumPolicy,
    state: EngineState,
    proposal: Option<String>,
    echoed: bool,
    joined: bool,
    // initiator only
    echoes: Vec<(NodeId, SignedMessage)>,
    rejects: Option<RejectManager>,
    heard: HashSet<NodeId>,
    commit_sent: bool,
}

impl EchoEngine {
    pub fn new(params: EngineParams) -> Self {
        let quorum = QuorumPolicy::new(params.participants.len());
        EchoEngine {
            round: params.round,
            local: params.local,
            participants: params.participants,
            quorum,
            state: EngineState::Idle,
            proposal: None,
            echoed: false,
            joined: false,
            echoes: Vec::new(),
            rejects: None,
            heard: HashSet::new(),
            commit_sent: false,
        }
    }

    fn is_initiator(&self) -> bool {
        &self.local == self.round.initiator()
    }

    fn decide(&mut self, outcome: Outcome) -> Vec<Effect> {
        debug!(round = %self.round, outcome = ?outcome, "Echo: decided");
        self.state = EngineState::Decided(outcome.clone());
        vec![Effect::CancelTimer(TimerKind::Round), Effect::Decide(outcome)]
    }

    fn on_init(&mut self, sender: &NodeId, proposal: &str, view: NodeView<'_>) -> Result<Vec<Effect>> {
        let common_random = view.common_random;
        if sender != self.round.initiator() {
            return Err(AgreementError::violation(&self.round, "INIT not sent by the initiator"));
        }
        if self.echoed {
            return match self.proposal.as_deref() {
                Some(p) if p == proposal => Ok(Vec::new()),
                _ => Err(AgreementError::violation(&self.round, "conflicting INIT")),
            };
        }
        if let Some(own) = self.proposal.as_deref() {
            if own != proposal {
                return Err(AgreementError::violation(&self.round, "INIT differs from own proposal"));
            }
        }

        if self.round.predecessor() != common_random {
            debug!(
                round = %self.round,
                ours = %common_random,
                "Echo: proposal names a stale predecessor, rejecting"
            );
            let reject = Payload::Reject {
                proposal: proposal.to_string(),
                last_common_random: common_random.to_string(),
            };
            let mut effects = vec![Effect::Send(self.round.initiator().clone(), reject)];
            self.state = EngineState::Decided(Outcome::Rejected(RejectCause::StalePredecessor));
            effects.push(Effect::Decide(Outcome::Rejected(RejectCause::StalePredecessor)));
            return Ok(effects);
        }
        if !view.may_endorse {
            // already echoed another proposal on this predecessor
            debug!(round = %self.round, "Echo: endorsement held by a concurrent round, staying silent");
            self.state = EngineState::ProposalReceived;
            return Ok(Vec::new());
        }

        self.proposal = Some(proposal.to_string());
        self.echoed = true;
        self.joined = true;
        self.state = EngineState::Collecting;
        Ok(vec![Effect::Send(
            self.round.initiator().clone(),
            Payload::Echo {
                proposal: proposal.to_string(),
            },
        )])
    }

    fn on_echo(&mut self, envelope: &Envelope, proposal: &str) -> Result<Vec<Effect>> {
        if !self.is_initiator() {
            return Err(AgreementError::violation(&self.round, "ECHO sent to a non-initiator"));
        }
        if self.proposal.as_deref() != Some(proposal) {
            return Err(AgreementError::violation(&self.round, "ECHO for a different proposal"));
        }
        let sender = &envelope.message.sender;
        if self.echoes.iter().any(|(id, _)| id == sender) {
            return Ok(Vec::new());
        }
        self.heard.insert(sender.clone());
        self.echoes.push((sender.clone(), envelope.sealed.clone()));

        if self.echoes.len() >= self.quorum.two_third_quorum() && !self.commit_sent {
            self.commit_sent = true;
            debug!(
                round = %self.round,
                echoes = self.echoes.len(),
                "Echo: quorum of echoes reached, committing"
            );
            return Ok(vec![Effect::Multicast(Payload::Commit {
                proposal: proposal.to_string(),
                echoes: self.echoes.iter().map(|(_, s)| s.clone()).collect(),
            })]);
        }
        Ok(self.check_reachability())
    }

    /// A COMMIT or CONFIRMATION must carry a quorum of distinct signed
    /// echoes of this round's proposal.
    fn validate_proof(&self, proposal: &str, proofs: &[Message]) -> Result<()> {
        let mut signers = HashSet::new();
        for echo in proofs {
            let matches = echo.round == self.round
                && matches!(&echo.payload, Payload::Echo { proposal: p } if p == proposal)
                && self.participants.contains(&echo.sender);
            if !matches {
                return Err(AgreementError::violation(&self.round, "commit proof holds a foreign echo"));
            }
            signers.insert(&echo.sender);
        }
        if signers.len() < self.quorum.two_third_quorum() {
            return Err(AgreementError::violation(
                &self.round,
                format!(
                    "commit proof holds {} echoes, {} required",
                    signers.len(),
                    self.quorum.two_third_quorum()
                ),
            ));
        }
        Ok(())
    }

    fn on_commit(
        &mut self,
        envelope: &Envelope,
        proposal: &str,
        echoes: &[SignedMessage],
        confirmation: bool,
    ) -> Result<Vec<Effect>> {
        if !confirmation && &envelope.message.sender != self.round.initiator() {
            return Err(AgreementError::violation(&self.round, "COMMIT not sent by the initiator"));
        }
        self.validate_proof(proposal, &envelope.embedded)?;

        let mut effects = Vec::new();
        if !confirmation && !self.is_initiator() {
            self.joined = true;
            effects.push(Effect::Multicast(Payload::Confirmation {
                proposal: proposal.to_string(),
                echoes: echoes.to_vec(),
            }));
        }
        effects.extend(self.decide(Outcome::Committed(proposal.to_string())));
        Ok(effects)
    }

    fn on_reject(&mut self, sender: &NodeId, proposal: &str, cited: &str) -> Result<Vec<Effect>> {
        let Some(rejects) = self.rejects.as_mut() else {
            return Err(AgreementError::violation(&self.round, "REJECT sent to a non-initiator"));
        };
        if !rejects.add(sender, proposal, cited) {
            return Ok(Vec::new());
        }
        self.heard.insert(sender.clone());

        match rejects.verdict() {
            RejectVerdict::Superseded(authoritative) => {
                Ok(self.decide(Outcome::Rejected(RejectCause::Superseded { authoritative })))
            }
            RejectVerdict::NoMajority => Ok(self.decide(Outcome::Rejected(RejectCause::NoMajority))),
            RejectVerdict::Pending => Ok(self.check_reachability()),
        }
    }

    /// Abort early once neither a commit nor a reject verdict can be reached.
    fn check_reachability(&mut self) -> Vec<Effect> {
        if self.commit_sent || !self.is_initiator() {
            return Vec::new();
        }
        let remaining = self.participants.len().saturating_sub(self.heard.len());
        if self.echoes.len() + remaining >= self.quorum.two_third_quorum() {
            return Vec::new();
        }
        let Some(rejects) = self.rejects.as_ref() else {
            return Vec::new();
        };
        if rejects.majority_reachable(remaining) {
            return Vec::new();
        }
        let cause = if rejects.quorum_reachable(remaining) {
            RejectCause::NoMajority
        } else {
            RejectCause::QuorumUnreachable
        };
        self.decide(Outcome::Rejected(cause))
    }
}

impl AgreementEngine for EchoEngine {
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
        if self.state != EngineState::Idle || !self.is_initiator() {
            return Vec::new();
        }
        self.proposal = Some(proposal.to_string());
        self.rejects = Some(RejectManager::new(proposal, self.quorum.two_third_quorum()));
        self.joined = true;
        self.state = EngineState::ProposalReceived;
        vec![Effect::Multicast(Payload::Init {
            proposal: proposal.to_string(),
        })]
    }

    fn endorsed(&self) -> bool {
        self.echoed
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
            // the claimed sender is unproven, so it has not spent its vote either
            debug!(round = %self.round, sender = %message.sender, "Echo: unauthenticated message not counted");
            return Ok(Vec::new());
        }

        match &message.payload {
            Payload::Init { proposal } => self.on_init(&message.sender, proposal, view),
            Payload::Echo { proposal } => self.on_echo(envelope, proposal),
            Payload::Commit { proposal, echoes } => self.on_commit(envelope, proposal, echoes, false),
            Payload::Confirmation { proposal, echoes } => {
                self.on_commit(envelope, proposal, echoes, true)
            }
            Payload::Reject {
                proposal,
                last_common_random,
            } => self.on_reject(&message.sender, proposal, last_common_random),
            other => Err(AgreementError::violation(
                &self.round,
                format!("unexpected {} in an echo round", other.kind()),
            )),
        }
    }

    fn on_timeout(&mut self, timer: TimerKind) -> Vec<Effect> {
        if self.state.is_terminal() || timer != TimerKind::Round {
            return Vec::new();
        }
        self.decide(Outcome::Rejected(RejectCause::Timeout))
    }

    fn retire(&mut self) {
        self.state = EngineState::Retired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::types::Phase;
    use std::time::Duration;

    fn ids() -> Vec<NodeId> {
        ["is-1", "is-2", "is-3", "is-4"].iter().map(|s| NodeId::from(*s)).collect()
    }

    fn engine(local: &str) -> EchoEngine {
        EchoEngine::new(EngineParams {
            round: RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 0),
            local: NodeId::from(local),
            participants: ids(),
            ballot_timeout: Duration::from_secs(10),
        })
    }

    fn envelope(engine: &EchoEngine, sender: &str, payload: Payload) -> Envelope {
        let message = Message::new(engine.round.clone(), NodeId::from(sender), payload);
        Envelope {
            sealed: SignedMessage {
                body: serde_json::to_string(&message).unwrap(),
                signature: String::new(),
            },
            message,
            signature_ok: true,
            embedded: Vec::new(),
        }
    }

    #[test]
    fn test_acceptor_echoes_matching_init() {
        let mut e = engine("is-2");
        let init = envelope(&e, "is-1", Payload::Init { proposal: "R7".into() });
        let effects = e.handle(&init, NodeView::new("R6")).unwrap();

        assert_eq!(e.state(), &EngineState::Collecting);
        assert!(e.has_joined());
        assert!(matches!(
            &effects[..],
            [Effect::Send(to, Payload::Echo { proposal })] if to.as_str() == "is-1" && proposal == "R7"
        ));
        // duplicate INIT changes nothing
        assert!(e.handle(&init, NodeView::new("R6")).unwrap().is_empty());
    }

    #[test]
    fn test_acceptor_rejects_stale_predecessor() {
        let mut e = engine("is-2");
        let init = envelope(&e, "is-1", Payload::Init { proposal: "R7".into() });
        let effects = e.handle(&init, NodeView::new("R5")).unwrap();

        assert!(matches!(
            &effects[0],
            Effect::Send(_, Payload::Reject { last_common_random, .. }) if last_common_random == "R5"
        ));
        assert!(matches!(
            effects.last(),
            Some(Effect::Decide(Outcome::Rejected(RejectCause::StalePredecessor)))
        ));
        assert!(!e.has_joined());
    }

    #[test]
    fn test_init_from_non_initiator_is_a_violation() {
        let mut e = engine("is-2");
        let init = envelope(&e, "is-3", Payload::Init { proposal: "R7".into() });
        assert!(e.handle(&init, NodeView::new("R6")).is_err());
    }

    #[test]
    fn test_initiator_commits_at_quorum() {
        let mut e = engine("is-1");
        assert_eq!(e.start("R7").len(), 1);
        let own = envelope(&e, "is-1", Payload::Init { proposal: "R7".into() });
        e.handle(&own, NodeView::new("R6")).unwrap();

        for (i, peer) in ["is-1", "is-2"].iter().enumerate() {
            let echo = envelope(&e, peer, Payload::Echo { proposal: "R7".into() });
            let effects = e.handle(&echo, NodeView::new("R6")).unwrap();
            assert!(effects.is_empty(), "echo {} committed early", i);
        }
        // duplicate echo is not counted
        let dup = envelope(&e, "is-2", Payload::Echo { proposal: "R7".into() });
        assert!(e.handle(&dup, NodeView::new("R6")).unwrap().is_empty());

        let third = envelope(&e, "is-3", Payload::Echo { proposal: "R7".into() });
        let effects = e.handle(&third, NodeView::new("R6")).unwrap();
        assert!(matches!(
            &effects[..],
            [Effect::Multicast(Payload::Commit { echoes, .. })] if echoes.len() == 3
        ));
    }

    #[test]
    fn test_commit_without_enough_proof_is_refused() {
        let mut e = engine("is-2");
        let commit = envelope(
            &e,
            "is-1",
            Payload::Commit {
                proposal: "R7".into(),
                echoes: Vec::new(),
            },
        );
        assert!(e.handle(&commit, NodeView::new("R6")).is_err());
        assert!(!e.state().is_terminal());
    }

    #[test]
    fn test_initiator_superseded_by_reject_quorum() {
        let mut e = engine("is-1");
        e.start("R7");
        for peer in ["is-2", "is-3"] {
            let reject = envelope(
                &e,
                peer,
                Payload::Reject {
                    proposal: "R7".into(),
                    last_common_random: "R6b".into(),
                },
            );
            assert!(e.handle(&reject, NodeView::new("R6")).unwrap().is_empty());
        }
        let reject = envelope(
            &e,
            "is-4",
            Payload::Reject {
                proposal: "R7".into(),
                last_common_random: "R6b".into(),
            },
        );
        let effects = e.handle(&reject, NodeView::new("R6")).unwrap();
        assert!(matches!(
            effects.last(),
            Some(Effect::Decide(Outcome::Rejected(RejectCause::Superseded { authoritative })))
                if authoritative == "R6b"
        ));
    }

    #[test]
    fn test_split_rejects_abort_without_majority() {
        let mut e = engine("is-1");
        e.start("R7");
        let own = envelope(&e, "is-1", Payload::Echo { proposal: "R7".into() });
        e.handle(&own, NodeView::new("R6")).unwrap();

        let r2 = envelope(&e, "is-2", Payload::Reject { proposal: "R7".into(), last_common_random: "X".into() });
        assert!(e.handle(&r2, NodeView::new("R6")).unwrap().is_empty());
        // one echo, two split rejects, one silent peer: no value can win
        let r3 = envelope(&e, "is-3", Payload::Reject { proposal: "R7".into(), last_common_random: "Y".into() });
        let effects = e.handle(&r3, NodeView::new("R6")).unwrap();
        assert!(matches!(
            effects.last(),
            Some(Effect::Decide(Outcome::Rejected(RejectCause::NoMajority)))
        ));
    }

    #[test]
    fn test_even_split_makes_quorum_unreachable() {
        let mut e = engine("is-1");
        e.start("R7");
        for peer in ["is-1", "is-2"] {
            let echo = envelope(&e, peer, Payload::Echo { proposal: "R7".into() });
            assert!(e.handle(&echo, NodeView::new("R6")).unwrap().is_empty());
        }
        let r3 = envelope(&e, "is-3", Payload::Reject { proposal: "R7".into(), last_common_random: "R6b".into() });
        assert!(e.handle(&r3, NodeView::new("R6")).unwrap().is_empty());

        // two echoes, two rejects, nobody left to tip either side
        let r4 = envelope(&e, "is-4", Payload::Reject { proposal: "R7".into(), last_common_random: "R6b".into() });
        let effects = e.handle(&r4, NodeView::new("R6")).unwrap();
        assert!(matches!(
            effects.last(),
            Some(Effect::Decide(Outcome::Rejected(RejectCause::QuorumUnreachable)))
        ));
    }

    #[test]
    fn test_unauthenticated_echo_is_not_counted() {
        let mut e = engine("is-1");
        e.start("R7");
        let own = envelope(&e, "is-1", Payload::Echo { proposal: "R7".into() });
        e.handle(&own, NodeView::new("R6")).unwrap();

        // forged traffic in the name of two peers neither counts nor aborts the round
        for peer in ["is-2", "is-3"] {
            let mut forged = envelope(&e, peer, Payload::Echo { proposal: "R7".into() });
            forged.signature_ok = false;
            assert!(e.handle(&forged, NodeView::new("R6")).unwrap().is_empty());
        }
        assert_eq!(e.echoes.len(), 1);
        assert_eq!(e.heard.len(), 1);
        assert!(!e.state().is_terminal());

        let mut commit = Vec::new();
        for peer in ["is-2", "is-3"] {
            let echo = envelope(&e, peer, Payload::Echo { proposal: "R7".into() });
            commit = e.handle(&echo, NodeView::new("R6")).unwrap();
        }
        assert!(matches!(
            &commit[..],
            [Effect::Multicast(Payload::Commit { echoes, .. })] if echoes.len() == 3
        ));
    }

    #[test]
    fn test_locked_acceptor_stays_silent() {
        let mut e = engine("is-2");
        let init = envelope(&e, "is-1", Payload::Init { proposal: "R7".into() });
        let effects = e.handle(&init, NodeView::new("R6").endorsing(false)).unwrap();

        assert!(effects.is_empty());
        assert!(!e.endorsed());
        assert!(!e.has_joined());
        assert!(!e.state().is_terminal());
    }

    #[test]
    fn test_timeout_rejects_and_then_ignores() {
        let mut e = engine("is-2");
        let effects = e.on_timeout(TimerKind::Round);
        assert!(matches!(
            effects.last(),
            Some(Effect::Decide(Outcome::Rejected(RejectCause::Timeout)))
        ));
        assert!(e.on_timeout(TimerKind::Round).is_empty());
        let init = envelope(&e, "is-1", Payload::Init { proposal: "R7".into() });
        assert!(e.handle(&init, NodeView::new("R6")).is_err());
    }
}
