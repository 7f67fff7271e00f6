//! A node: registry, proposer and engines wired to the outside world
//!
//! All protocol state is touched only from [`Node::handle_event`], which
//! the dispatcher calls for one event at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Span};

use crate::agreement::codec::{AuthenticityPolicy, Envelope, MessageFactory, SignatureService};
use crate::agreement::engines::{build_engine, EngineParams};
use crate::agreement::message::{Message, Payload, SignedMessage};
use crate::agreement::proposer::{Proposer, ProposerStep};
use crate::agreement::queue::{Event, EventHandler};
use crate::agreement::quorum::TimingPolicy;
use crate::agreement::registry::{Registry, SeedHandle};
use crate::agreement::timer::{SessionTimer, TimerFired, TimerService, TimerTarget, TimerToken};
use crate::agreement::traits::{AgreementListener, PeerDirectory};
use crate::agreement::types::{
    Effect, NodeId, NodeView, Phase, ProtocolVariant, RoundId, Settlement, TimerKind,
};
use crate::config::AgreementConfig;
use crate::error::{AgreementError, Result};

/// The node's part in the commit-reveal epoch on `predecessor`.
struct EpochSession {
    predecessor: String,
    timers: HashMap<SessionTimer, TimerToken>,
    contributed: bool,
}

pub struct Node<D: PeerDirectory, T: TimerService> {
    local: NodeId,
    variant: ProtocolVariant,
    timing: TimingPolicy,
    registry: Registry,
    proposer: Proposer,
    factory: MessageFactory,
    directory: D,
    timers: T,
    span: Span,
    /// Messages this node addressed to itself, delivered after the current event.
    pending: VecDeque<Envelope>,
    epoch: Option<EpochSession>,
}

impl<D: PeerDirectory, T: TimerService> Node<D, T> {
    pub fn new(
        config: &AgreementConfig,
        signer: Arc<dyn SignatureService>,
        directory: D,
        timers: T,
        listener: Arc<dyn AgreementListener>,
        seed: SeedHandle,
    ) -> Self {
        let local = directory.local_id().clone();
        let policy = AuthenticityPolicy::tolerating(config.tolerate_unsigned.iter().copied());
        Node {
            span: info_span!("infoservice", node = %local),
            variant: config.variant,
            timing: config.timing,
            registry: Registry::new(seed, listener, config.min_participants),
            proposer: Proposer::new(local.clone(), config.max_reproposals),
            factory: MessageFactory::new(signer, policy),
            local,
            directory,
            timers,
            pending: VecDeque::new(),
            epoch: None,
        }
    }

    /// Replace the logging span the node records under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn common_random(&self) -> String {
        self.registry.common_random()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_proposing(&self) -> bool {
        self.proposer.is_active()
    }

    /// Predecessor of the epoch this node currently takes part in.
    pub fn epoch_predecessor(&self) -> Option<&str> {
        self.epoch.as_ref().map(|e| e.predecessor.as_str())
    }

    /// Propose `value` as the next common random.
    pub fn propose(&mut self, value: &str) -> Result<RoundId> {
        let span = self.span.clone();
        let _guard = span.enter();

        let (round, proposal) = self.proposer.propose(value, &self.registry.common_random())?;
        let result = self.launch(round.clone(), proposal);
        self.pump();
        result.map(|_| round)
    }

    /// Contribute `value` to the commit-reveal epoch on the current common
    /// random, opening the epoch if needed. Peers join with contributions
    /// of their own; the combined value is agreed once the reveal phase is
    /// over.
    pub fn propose_with_commitment(&mut self, value: &str) -> Result<RoundId> {
        let span = self.span.clone();
        let _guard = span.enter();

        let predecessor = self.registry.common_random();
        if self
            .epoch
            .as_ref()
            .is_some_and(|e| e.predecessor == predecessor && e.contributed)
        {
            return Err(AgreementError::violation(
                format!("epoch {}", predecessor),
                "already contributed to this epoch",
            ));
        }
        let (round, proposal) = self.proposer.begin_commitment(value, &predecessor)?;
        self.join_epoch(&predecessor, true);
        let result = self.launch(round.clone(), proposal);
        self.pump();
        result.map(|_| round)
    }

    /// Decode and process raw bytes received from `from`.
    pub fn handle_raw(&mut self, from: &NodeId, bytes: &[u8]) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();

        if !self.directory.participants().contains(from) {
            return Err(AgreementError::authenticity(from, "not a known participant"));
        }
        let envelope = self.factory.decode(from, bytes)?;
        let result = self.deliver(envelope);
        self.pump();
        result
    }

    pub fn handle_timer(&mut self, fired: TimerFired) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();

        self.timers.cancel(fired.token);
        let result = match fired.target {
            TimerTarget::Round(round, kind) => self.round_timeout(round, kind, fired.token),
            TimerTarget::Session(which) => self.session_timeout(which, fired.token),
        };
        self.pump();
        result
    }

    fn round_timeout(&mut self, round: RoundId, kind: TimerKind, token: TimerToken) -> Result<()> {
        if !self.registry.timer_matches(&round, kind, token) {
            debug!(round = %round, timer = ?kind, "Node: stale timer ignored");
            return Ok(());
        }
        self.registry.take_timer(&round, kind);
        let effects = match self.registry.engine_mut(&round) {
            Some(engine) => engine.on_timeout(kind),
            None => return Ok(()),
        };
        self.apply(&round, effects)
    }

    fn session_timeout(&mut self, which: SessionTimer, token: TimerToken) -> Result<()> {
        let Some(session) = self.epoch.as_mut() else {
            return Ok(());
        };
        if session.timers.get(&which) != Some(&token) {
            return Ok(());
        }
        session.timers.remove(&which);
        let predecessor = session.predecessor.clone();

        match which {
            SessionTimer::CommitDeadline => {
                self.registry.seal_commitments(&predecessor);
                debug!(predecessor = %predecessor, "Node: commit phase over");
                self.arm_session(SessionTimer::RevealDue, self.timing.inter_phase_gap);
                Ok(())
            }
            SessionTimer::RevealDue => {
                self.arm_session(SessionTimer::RevealDeadline, self.timing.phase_timeout);
                match self.proposer.reveal(&predecessor) {
                    Some((round, proposal)) => self.launch(round, proposal),
                    None => Ok(()),
                }
            }
            SessionTimer::RevealDeadline => {
                if self.proposer.in_epoch() {
                    if let Some(round) = self.proposer.abandon() {
                        warn!(round = %round, "Node: reveal phase over, abandoning the contribution");
                    }
                }
                let participants = self.directory.participants().len();
                self.registry.close_epoch(&predecessor, participants, &self.local);
                self.leave_epoch();
                Ok(())
            }
        }
    }

    /// Take part in the epoch on `predecessor`, leaving any older one.
    fn join_epoch(&mut self, predecessor: &str, contributed: bool) {
        let joined = self
            .epoch
            .as_ref()
            .is_some_and(|e| e.predecessor == predecessor);
        if !joined {
            self.leave_epoch();
            info!(predecessor = %predecessor, "Node: joining commit-reveal epoch");
            self.registry.open_epoch(predecessor);
            self.epoch = Some(EpochSession {
                predecessor: predecessor.to_string(),
                timers: HashMap::new(),
                contributed: false,
            });
            self.arm_session(SessionTimer::CommitDeadline, self.timing.phase_timeout);
        }
        if let Some(session) = self.epoch.as_mut() {
            session.contributed |= contributed;
        }
    }

    /// Join an epoch a peer opened, with a random contribution when the
    /// proposer is free.
    fn join_peer_epoch(&mut self, predecessor: &str) {
        let contribution = hex::encode(rand::random::<[u8; 8]>());
        match self.proposer.begin_commitment(&contribution, predecessor) {
            Ok((round, proposal)) => {
                self.join_epoch(predecessor, true);
                if let Err(e) = self.launch(round, proposal) {
                    warn!(error = %e, "Node: contribution failed to start");
                }
            }
            Err(e) => {
                debug!(error = %e, "Node: joining the epoch without a contribution");
                self.join_epoch(predecessor, false);
            }
        }
    }

    fn arm_session(&mut self, which: SessionTimer, after: Duration) {
        let Some(session) = self.epoch.as_mut() else {
            return;
        };
        let token = self.timers.arm(TimerTarget::Session(which), after);
        if let Some(old) = session.timers.insert(which, token) {
            self.timers.cancel(old);
        }
    }

    fn leave_epoch(&mut self) {
        if let Some(mut session) = self.epoch.take() {
            for (_, token) in session.timers.drain() {
                self.timers.cancel(token);
            }
        }
    }

    fn engine_params(&self, round: &RoundId) -> EngineParams {
        EngineParams {
            round: round.clone(),
            local: self.local.clone(),
            participants: self.directory.participants(),
            ballot_timeout: self.timing.ballot_timeout,
        }
    }

    /// Create the engine for `round` if needed, arming its round timer.
    fn ensure_round(&mut self, round: &RoundId) -> Result<()> {
        let params = self.engine_params(round);
        let variant = self.variant;
        let participants = params.participants.len();
        let created = self
            .registry
            .start_round(round, participants, move || build_engine(variant, params))?;
        if created {
            let token = self.timers.arm(
                TimerTarget::Round(round.clone(), TimerKind::Round),
                self.timing.round_timeout,
            );
            self.remember_timer(round, TimerKind::Round, token);
        }
        Ok(())
    }

    fn launch(&mut self, round: RoundId, proposal: String) -> Result<()> {
        if let Err(e) = self.ensure_round(&round) {
            self.proposer.abandon();
            return Err(e);
        }
        let effects = match self.registry.engine_mut(&round) {
            Some(engine) => engine.start(&proposal),
            None => return Ok(()),
        };
        self.apply(&round, effects)
    }

    fn deliver(&mut self, envelope: Envelope) -> Result<()> {
        let round = envelope.message.round.clone();
        if self.registry.is_retired(&round) {
            debug!(
                round = %round,
                kind = %envelope.message.kind(),
                "Node: message for retired round ignored"
            );
            return Ok(());
        }
        if round.phase() == Phase::Close {
            return Err(AgreementError::violation(&round, "epoch closes are never sent"));
        }
        self.ensure_round(&round)?;
        let common_random = self.registry.common_random();
        let opens_epoch = round.phase() == Phase::Commitment
            && round.predecessor() == common_random
            && envelope.signature_ok
            && self.epoch_predecessor() != Some(common_random.as_str());
        if opens_epoch {
            self.join_peer_epoch(&common_random);
        }

        let view = NodeView::new(&common_random).endorsing(self.registry.may_endorse(&round));
        let effects = match self.registry.engine_mut(&round) {
            Some(engine) => engine.handle(&envelope, view)?,
            None => return Ok(()),
        };
        self.registry.note_endorsement(&round);
        self.apply(&round, effects)
    }

    fn apply(&mut self, round: &RoundId, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::Send(to, payload) => {
                    let sealed = self.seal(round, payload)?;
                    if to == self.local {
                        self.loopback(sealed)?;
                    } else {
                        let bytes = self.factory.encode(&sealed)?;
                        if let Err(e) = self.directory.send_to(&to, bytes) {
                            warn!(peer = %to, error = %e, "Node: send failed");
                        }
                    }
                }
                Effect::Multicast(payload) => {
                    let sealed = self.seal(round, payload)?;
                    let bytes = self.factory.encode(&sealed)?;
                    self.directory.multicast(bytes);
                    self.loopback(sealed)?;
                }
                Effect::ArmTimer(kind, after) => {
                    let token = self.timers.arm(TimerTarget::Round(round.clone(), kind), after);
                    self.remember_timer(round, kind, token);
                }
                Effect::CancelTimer(kind) => {
                    if let Some(token) = self.registry.take_timer(round, kind) {
                        self.timers.cancel(token);
                    }
                }
                Effect::Decide(outcome) => {
                    if let Some(settlement) = self.registry.on_decided(round, outcome, &mut self.timers) {
                        self.after_settlement(settlement)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn remember_timer(&mut self, round: &RoundId, kind: TimerKind, token: TimerToken) {
        match self.registry.set_timer(round, kind, token) {
            Ok(Some(replaced)) => self.timers.cancel(replaced),
            Ok(None) => {}
            Err(orphan) => self.timers.cancel(orphan),
        }
    }

    fn after_settlement(&mut self, settlement: Settlement) -> Result<()> {
        match self.proposer.on_settled(&settlement) {
            ProposerStep::Idle | ProposerStep::AwaitReveal | ProposerStep::Done => Ok(()),
            ProposerStep::Propose { round, proposal } => {
                if round.phase() == Phase::Commitment {
                    // the contribution moves to the epoch on the authoritative value
                    self.join_epoch(round.predecessor(), true);
                }
                self.launch(round, proposal)
            }
        }
    }

    fn seal(&self, round: &RoundId, payload: Payload) -> Result<SignedMessage> {
        self.factory
            .seal(&Message::new(round.clone(), self.local.clone(), payload))
    }

    fn loopback(&mut self, sealed: SignedMessage) -> Result<()> {
        let envelope = self.factory.open(sealed)?;
        self.pending.push_back(envelope);
        Ok(())
    }

    /// Deliver self-addressed messages until none are left.
    fn pump(&mut self) {
        while let Some(envelope) = self.pending.pop_front() {
            if let Err(e) = self.deliver(envelope) {
                if e.is_benign() {
                    debug!(error = %e, "Node: local message ignored");
                } else {
                    warn!(error = %e, "Node: local message failed");
                }
            }
        }
    }
}

impl<D: PeerDirectory, T: TimerService> EventHandler for Node<D, T> {
    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Inbound { from, payload } => self.handle_raw(&from, &payload),
            Event::Timer(fired) => self.handle_timer(fired),
            Event::Propose { value, committed } => {
                let started = if committed {
                    self.propose_with_commitment(&value)
                } else {
                    self.propose(&value)
                };
                started.map(|_| ())
            }
            Event::Shutdown => Ok(()),
        }
    }
}
