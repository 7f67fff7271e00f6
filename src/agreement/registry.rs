//! Round registry: live engines, retired rounds and the common random

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agreement::epoch::Epoch;
use crate::agreement::quorum::QuorumPolicy;
use crate::agreement::timer::{TimerService, TimerToken};
use crate::agreement::traits::{AgreementEngine, AgreementListener};
use crate::agreement::types::{
    NodeId, Outcome, Phase, RejectCause, RoundId, Settlement, SettlementKind, TimerKind,
};
use crate::error::{AgreementError, Result};

/// Retired round ids remembered to recognise late messages.
const RETIRED_CAPACITY: usize = 4096;

/// Shared read handle on the node's current common random.
///
/// Only the registry writes through it; readers must tolerate the value
/// changing between two reads.
#[derive(Clone, Debug)]
pub struct SeedHandle(Arc<RwLock<String>>);

impl SeedHandle {
    pub fn new(initial: impl Into<String>) -> Self {
        SeedHandle(Arc::new(RwLock::new(initial.into())))
    }

    pub fn current(&self) -> String {
        self.0.read().clone()
    }

    fn replace(&self, value: String) -> String {
        std::mem::replace(&mut *self.0.write(), value)
    }
}

struct LiveRound {
    engine: Box<dyn AgreementEngine>,
    timers: HashMap<TimerKind, TimerToken>,
}

pub struct Registry {
    live: HashMap<RoundId, LiveRound>,
    retired: HashSet<RoundId>,
    retired_order: VecDeque<RoundId>,
    seed: SeedHandle,
    /// The direct round this node vouched for, per predecessor.
    endorsements: HashMap<String, RoundId>,
    /// Commit-reveal epoch on the current common random, if any.
    epoch: Option<Epoch>,
    listener: Arc<dyn AgreementListener>,
    min_participants: usize,
}

impl Registry {
    pub fn new(seed: SeedHandle, listener: Arc<dyn AgreementListener>, min_participants: usize) -> Self {
        Registry {
            live: HashMap::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
            seed,
            endorsements: HashMap::new(),
            epoch: None,
            listener,
            min_participants,
        }
    }

    /// Create the engine for `round` unless one is already live.
    /// Returns whether a new engine was created.
    pub fn start_round<F>(&mut self, round: &RoundId, participants: usize, build: F) -> Result<bool>
    where
        F: FnOnce() -> Box<dyn AgreementEngine>,
    {
        if self.retired.contains(round) {
            return Err(AgreementError::violation(round, "round already retired"));
        }
        if round.phase() == Phase::Close {
            return Err(AgreementError::violation(round, "epoch closes are local"));
        }
        if self.live.contains_key(round) {
            return Ok(false);
        }
        if participants < self.min_participants {
            return Err(AgreementError::QuorumUnreachable {
                available: participants,
                required: self.min_participants,
            });
        }
        debug!(round = %round, "Registry: starting round");
        self.live.insert(
            round.clone(),
            LiveRound {
                engine: build(),
                timers: HashMap::new(),
            },
        );
        Ok(true)
    }

    pub fn engine_mut(&mut self, round: &RoundId) -> Option<&mut Box<dyn AgreementEngine>> {
        self.live.get_mut(round).map(|live| &mut live.engine)
    }

    pub fn is_live(&self, round: &RoundId) -> bool {
        self.live.contains_key(round)
    }

    pub fn is_retired(&self, round: &RoundId) -> bool {
        self.retired.contains(round)
    }

    pub fn live_rounds(&self) -> usize {
        self.live.len()
    }

    pub fn common_random(&self) -> String {
        self.seed.current()
    }

    pub fn seed_handle(&self) -> SeedHandle {
        self.seed.clone()
    }

    pub fn commitment_of(&self, initiator: &NodeId) -> Option<&str> {
        self.epoch.as_ref()?.commitment_of(initiator)
    }

    pub fn epoch(&self) -> Option<&Epoch> {
        self.epoch.as_ref()
    }

    /// Whether the node may vouch for the first-phase value of `round`.
    /// Only one direct round per predecessor can hold the endorsement;
    /// epoch rounds run side by side.
    pub fn may_endorse(&self, round: &RoundId) -> bool {
        if round.phase() != Phase::Direct {
            return true;
        }
        self.endorsements
            .get(round.predecessor())
            .map_or(true, |holder| holder == round)
    }

    /// Record that the engine of `round` vouched for its value.
    pub fn note_endorsement(&mut self, round: &RoundId) {
        if round.phase() != Phase::Direct || self.endorsements.contains_key(round.predecessor()) {
            return;
        }
        let endorsed = self
            .live
            .get(round)
            .is_some_and(|live| live.engine.endorsed());
        if endorsed {
            debug!(round = %round, "Registry: endorsement taken");
            self.endorsements
                .insert(round.predecessor().to_string(), round.clone());
        }
    }

    /// Open the epoch on `predecessor` unless it is already open.
    pub fn open_epoch(&mut self, predecessor: &str) {
        if self.epoch.as_ref().is_some_and(|e| e.predecessor() == predecessor) {
            return;
        }
        debug!(predecessor = %predecessor, "Registry: epoch opened");
        self.epoch = Some(Epoch::new(predecessor));
    }

    /// End the commit phase of the epoch on `predecessor`.
    pub fn seal_commitments(&mut self, predecessor: &str) -> bool {
        match self.epoch.as_mut() {
            Some(epoch) if epoch.predecessor() == predecessor => {
                epoch.seal();
                true
            }
            _ => false,
        }
    }

    /// Combine the epoch on `predecessor` into the next common random.
    ///
    /// The outcome is published like that of a round, under a local
    /// [`Phase::Close`] round id. An epoch overtaken by another agreement
    /// ends without notifying.
    pub fn close_epoch(&mut self, predecessor: &str, participants: usize, local: &NodeId) -> Option<Settlement> {
        let epoch = match self.epoch.take() {
            Some(epoch) if epoch.predecessor() == predecessor => epoch,
            other => {
                self.epoch = other;
                return None;
            }
        };
        let round = RoundId::derive(predecessor, local, Phase::Close, 0);
        let old = self.seed.current();
        let required = QuorumPolicy::new(participants).critical_mass();

        let (kind, new, notify) = if old != predecessor {
            (SettlementKind::Failed(RejectCause::StalePredecessor), None, false)
        } else {
            match epoch.combine(required) {
                Ok(value) => {
                    self.seed.replace(value.clone());
                    self.endorsements.clear();
                    (SettlementKind::Agreed, Some(value), true)
                }
                Err(verified) => (
                    SettlementKind::Failed(RejectCause::TooFewReveals { verified, required }),
                    None,
                    true,
                ),
            }
        };
        let settlement = Settlement {
            round,
            kind,
            old_common_random: old,
            new_common_random: new,
            current_common_random: self.seed.current(),
            notified: notify,
        };
        self.publish(&settlement);
        Some(settlement)
    }

    /// Remember the token of a freshly armed timer. Returns the token it
    /// replaces, or `Err(token)` when the round is not live any more.
    pub fn set_timer(
        &mut self,
        round: &RoundId,
        kind: TimerKind,
        token: TimerToken,
    ) -> std::result::Result<Option<TimerToken>, TimerToken> {
        match self.live.get_mut(round) {
            Some(live) => Ok(live.timers.insert(kind, token)),
            None => Err(token),
        }
    }

    pub fn take_timer(&mut self, round: &RoundId, kind: TimerKind) -> Option<TimerToken> {
        self.live.get_mut(round)?.timers.remove(&kind)
    }

    /// Whether `token` is the live timer of `kind` for `round`, i.e. not stale.
    pub fn timer_matches(&self, round: &RoundId, kind: TimerKind, token: TimerToken) -> bool {
        self.live
            .get(round)
            .and_then(|live| live.timers.get(&kind))
            .is_some_and(|t| *t == token)
    }

    /// Retire a decided round: cancel its timers, drop the engine, update
    /// the common random and notify the listener.
    pub fn on_decided(
        &mut self,
        round: &RoundId,
        outcome: Outcome,
        timers: &mut dyn TimerService,
    ) -> Option<Settlement> {
        let mut live = self.live.remove(round)?;
        for (_, token) in live.timers.drain() {
            timers.cancel(token);
        }
        let joined = live.engine.has_joined();
        live.engine.retire();
        self.retire(round.clone());

        let old = self.seed.current();
        let (kind, new, notify) = match outcome {
            Outcome::Committed(value) => self.settle_commit(round, value, joined),
            Outcome::Rejected(RejectCause::StalePredecessor) => {
                (SettlementKind::Failed(RejectCause::StalePredecessor), None, false)
            }
            Outcome::Rejected(RejectCause::Superseded { authoritative }) => {
                if authoritative != old {
                    info!(round = %round, authoritative = %authoritative, "Registry: adopting authoritative common random");
                    self.seed.replace(authoritative.clone());
                }
                (
                    SettlementKind::Failed(RejectCause::Superseded { authoritative }),
                    None,
                    joined && round.phase() == Phase::Direct,
                )
            }
            Outcome::Rejected(cause) => (
                SettlementKind::Failed(cause),
                None,
                joined && round.phase() == Phase::Direct,
            ),
        };

        let current = self.seed.current();
        self.endorsements
            .retain(|predecessor, holder| holder != round && *predecessor == current);

        let settlement = Settlement {
            round: round.clone(),
            kind,
            old_common_random: old,
            new_common_random: new,
            current_common_random: current,
            notified: notify,
        };
        self.publish(&settlement);
        Some(settlement)
    }

    fn publish(&self, settlement: &Settlement) {
        let round = &settlement.round;
        match &settlement.kind {
            SettlementKind::Agreed => info!(
                round = %round,
                old = %settlement.old_common_random,
                new = ?settlement.new_common_random,
                "Registry: agreement reached"
            ),
            SettlementKind::CommitmentRecorded => {
                debug!(round = %round, "Registry: commitment recorded")
            }
            SettlementKind::RevealRecorded => debug!(round = %round, "Registry: reveal verified"),
            SettlementKind::Failed(cause) => {
                warn!(round = %round, cause = %cause, "Registry: round ended without a new value")
            }
        }

        if settlement.notified {
            self.listener.notify_agreement(
                &settlement.old_common_random,
                settlement.new_common_random.as_deref(),
            );
        }
        self.listener.round_settled(settlement);
    }

    /// A committed value only takes effect on the predecessor it was
    /// proposed for. Epoch steps are recorded and never notify.
    fn settle_commit(&mut self, round: &RoundId, value: String, joined: bool) -> (SettlementKind, Option<String>, bool) {
        let current = self.seed.current();
        match round.phase() {
            Phase::Direct if round.predecessor() != current => {
                warn!(round = %round, current = %current, "Registry: commit on a superseded predecessor ignored");
                (SettlementKind::Failed(RejectCause::StalePredecessor), None, joined)
            }
            Phase::Direct => {
                self.seed.replace(value.clone());
                (SettlementKind::Agreed, Some(value), true)
            }
            Phase::Commitment => {
                if round.predecessor() != current {
                    return (SettlementKind::Failed(RejectCause::StalePredecessor), None, false);
                }
                self.open_epoch(&current);
                let recorded = self
                    .epoch
                    .as_mut()
                    .is_some_and(|epoch| epoch.record_commitment(round.initiator(), value));
                if recorded {
                    (SettlementKind::CommitmentRecorded, None, false)
                } else {
                    (SettlementKind::Failed(RejectCause::CommitmentRefused), None, false)
                }
            }
            Phase::Reveal => {
                let epoch = self
                    .epoch
                    .as_mut()
                    .filter(|epoch| epoch.predecessor() == round.predecessor());
                let Some(epoch) = epoch else {
                    return (SettlementKind::Failed(RejectCause::StalePredecessor), None, false);
                };
                match epoch.record_reveal(round.initiator(), &value) {
                    Some(_) => (SettlementKind::RevealRecorded, None, false),
                    None => (SettlementKind::Failed(RejectCause::RevealMismatch), None, false),
                }
            }
            Phase::Close => (SettlementKind::Failed(RejectCause::StalePredecessor), None, false),
        }
    }

    fn retire(&mut self, round: RoundId) {
        if self.retired.insert(round.clone()) {
            self.retired_order.push_back(round);
        }
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::codec::Envelope;
    use crate::agreement::commitment::Commitment;
    use crate::agreement::engines::{EchoEngine, EngineParams};
    use crate::agreement::message::{Message, Payload, SignedMessage};
    use crate::agreement::types::NodeView;
    use crate::agreement::timer::TimerTarget;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Notes {
        calls: Mutex<Vec<(String, Option<String>)>>,
        settled: Mutex<usize>,
    }

    impl AgreementListener for Notes {
        fn notify_agreement(&self, old: &str, new: Option<&str>) {
            self.calls.lock().push((old.to_string(), new.map(String::from)));
        }

        fn round_settled(&self, _settlement: &Settlement) {
            *self.settled.lock() += 1;
        }
    }

    #[derive(Default)]
    struct CountingTimers {
        next: u64,
        cancelled: Vec<TimerToken>,
    }

    impl TimerService for CountingTimers {
        fn arm(&mut self, _target: TimerTarget, _after: Duration) -> TimerToken {
            self.next += 1;
            TimerToken::new(self.next)
        }

        fn cancel(&mut self, token: TimerToken) {
            self.cancelled.push(token);
        }
    }

    fn participants() -> Vec<NodeId> {
        ["is-1", "is-2", "is-3", "is-4"].iter().map(|s| NodeId::from(*s)).collect()
    }

    fn start(registry: &mut Registry, round: &RoundId) -> bool {
        let params = EngineParams {
            round: round.clone(),
            local: NodeId::from("is-1"),
            participants: participants(),
            ballot_timeout: Duration::from_secs(10),
        };
        registry
            .start_round(round, 4, || Box::new(EchoEngine::new(params)))
            .unwrap()
    }

    fn joined(registry: &mut Registry, round: &RoundId) {
        registry.engine_mut(round).unwrap().start("R7");
    }

    fn setup() -> (Registry, Arc<Notes>) {
        let notes = Arc::new(Notes::default());
        (Registry::new(SeedHandle::new("R6"), notes.clone(), 3), notes)
    }

    #[test]
    fn test_start_round_creates_once() {
        let (mut registry, _) = setup();
        let round = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 1);
        assert!(start(&mut registry, &round));
        assert!(!start(&mut registry, &round));
        assert_eq!(registry.live_rounds(), 1);
    }

    #[test]
    fn test_too_few_participants() {
        let (mut registry, _) = setup();
        let round = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 1);
        let params = EngineParams {
            round: round.clone(),
            local: NodeId::from("is-1"),
            participants: participants()[..2].to_vec(),
            ballot_timeout: Duration::from_secs(10),
        };
        let err = registry
            .start_round(&round, 2, || Box::new(EchoEngine::new(params)))
            .unwrap_err();
        assert!(matches!(err, AgreementError::QuorumUnreachable { available: 2, required: 3 }));
    }

    #[test]
    fn test_commit_updates_seed_notifies_and_retires() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        let round = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 1);
        start(&mut registry, &round);
        let token = timers.arm(TimerTarget::Round(round.clone(), TimerKind::Round), Duration::from_secs(1));
        registry.set_timer(&round, TimerKind::Round, token).unwrap();
        assert!(registry.timer_matches(&round, TimerKind::Round, token));

        let s = registry
            .on_decided(&round, Outcome::Committed("R7".into()), &mut timers)
            .unwrap();
        assert_eq!(s.kind, SettlementKind::Agreed);
        assert_eq!(registry.common_random(), "R7");
        assert_eq!(timers.cancelled, vec![token]);
        assert_eq!(*notes.calls.lock(), vec![("R6".to_string(), Some("R7".to_string()))]);
        assert!(registry.is_retired(&round));
        assert!(start_err(&mut registry, &round));
        // a second decision for the same round is a no-op
        assert!(registry.on_decided(&round, Outcome::Committed("R8".into()), &mut timers).is_none());
        assert_eq!(notes.calls.lock().len(), 1);
    }

    fn start_err(registry: &mut Registry, round: &RoundId) -> bool {
        let params = EngineParams {
            round: round.clone(),
            local: NodeId::from("is-1"),
            participants: participants(),
            ballot_timeout: Duration::from_secs(10),
        };
        registry
            .start_round(round, 4, || Box::new(EchoEngine::new(params)))
            .is_err()
    }

    #[test]
    fn test_timer_after_retirement_is_refused() {
        let (mut registry, _) = setup();
        let mut timers = CountingTimers::default();
        let round = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 1);
        start(&mut registry, &round);
        registry.on_decided(&round, Outcome::Rejected(RejectCause::Timeout), &mut timers);
        assert_eq!(
            registry.set_timer(&round, TimerKind::Round, TimerToken::new(9)),
            Err(TimerToken::new(9))
        );
    }

    #[test]
    fn test_stale_predecessor_and_idle_rejects_are_silent() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        let stale = RoundId::derive("R5", &NodeId::from("is-2"), Phase::Direct, 1);
        start(&mut registry, &stale);
        registry.on_decided(&stale, Outcome::Rejected(RejectCause::StalePredecessor), &mut timers);

        let idle = RoundId::derive("R6", &NodeId::from("is-3"), Phase::Direct, 1);
        start(&mut registry, &idle);
        registry.on_decided(&idle, Outcome::Rejected(RejectCause::Timeout), &mut timers);

        assert!(notes.calls.lock().is_empty());
        assert_eq!(*notes.settled.lock(), 2);
    }

    #[test]
    fn test_superseded_adopts_authoritative_value() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        let round = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 1);
        start(&mut registry, &round);
        joined(&mut registry, &round);

        let outcome = Outcome::Rejected(RejectCause::Superseded {
            authoritative: "R6b".into(),
        });
        let s = registry.on_decided(&round, outcome, &mut timers).unwrap();
        assert_eq!(s.new_common_random, None);
        assert_eq!(s.current_common_random, "R6b");
        assert_eq!(*notes.calls.lock(), vec![("R6".to_string(), None)]);
    }

    #[test]
    fn test_commit_on_a_superseded_predecessor_is_ignored() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        let first = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 1);
        let second = RoundId::derive("R6", &NodeId::from("is-2"), Phase::Direct, 1);
        start(&mut registry, &first);
        start(&mut registry, &second);

        registry.on_decided(&first, Outcome::Committed("R7".into()), &mut timers);
        let s = registry
            .on_decided(&second, Outcome::Committed("R8".into()), &mut timers)
            .unwrap();
        assert_eq!(s.kind, SettlementKind::Failed(RejectCause::StalePredecessor));
        assert_eq!(s.current_common_random, "R7");
        assert_eq!(registry.common_random(), "R7");
        assert_eq!(*notes.calls.lock(), vec![("R6".to_string(), Some("R7".to_string()))]);
    }

    #[test]
    fn test_one_endorsement_per_predecessor() {
        let (mut registry, _) = setup();
        let mut timers = CountingTimers::default();
        let first = RoundId::derive("R6", &NodeId::from("is-2"), Phase::Direct, 1);
        let second = RoundId::derive("R6", &NodeId::from("is-3"), Phase::Direct, 1);
        let commit = RoundId::derive("R6", &NodeId::from("is-3"), Phase::Commitment, 2);
        start(&mut registry, &first);
        start(&mut registry, &second);

        // is-1 echoes the INIT of the first round
        let init = Message::new(first.clone(), NodeId::from("is-2"), Payload::Init { proposal: "R7".into() });
        let envelope = Envelope {
            sealed: SignedMessage {
                body: String::new(),
                signature: String::new(),
            },
            message: init,
            signature_ok: true,
            embedded: Vec::new(),
        };
        registry
            .engine_mut(&first)
            .unwrap()
            .handle(&envelope, NodeView::new("R6"))
            .unwrap();
        registry.note_endorsement(&first);

        assert!(registry.may_endorse(&first));
        assert!(!registry.may_endorse(&second));
        assert!(registry.may_endorse(&commit));

        // the lock goes with the round that holds it
        registry.on_decided(&first, Outcome::Rejected(RejectCause::Timeout), &mut timers);
        assert!(registry.may_endorse(&second));
    }

    /// Commit and reveal `value` for `contributor` through the registry.
    fn contribute(registry: &mut Registry, timers: &mut CountingTimers, contributor: &str, value: &str, seq: u64) -> Commitment {
        let initiator = NodeId::from(contributor);
        let commitment = Commitment::generate(value);
        let round = RoundId::derive("R6", &initiator, Phase::Commitment, seq);
        start(registry, &round);
        let s = registry
            .on_decided(&round, Outcome::Committed(commitment.commitment_string()), timers)
            .unwrap();
        assert_eq!(s.kind, SettlementKind::CommitmentRecorded);
        assert!(!s.notified);
        commitment
    }

    fn reveal(registry: &mut Registry, timers: &mut CountingTimers, contributor: &str, reveal: String, seq: u64) -> SettlementKind {
        let round = RoundId::derive("R6", &NodeId::from(contributor), Phase::Reveal, seq);
        start(registry, &round);
        registry
            .on_decided(&round, Outcome::Committed(reveal), timers)
            .unwrap()
            .kind
    }

    #[test]
    fn test_epoch_combines_verified_reveals() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        let mut commitments = Vec::new();
        for (i, contributor) in ["is-1", "is-2", "is-3", "is-4"].iter().enumerate() {
            commitments.push(contribute(&mut registry, &mut timers, contributor, &format!("c{}", i), 1));
        }
        assert!(registry.commitment_of(&NodeId::from("is-3")).is_some());
        assert!(registry.seal_commitments("R6"));

        // sealed: a late commitment is refused
        let late = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Commitment, 9);
        start(&mut registry, &late);
        let s = registry
            .on_decided(&late, Outcome::Committed("late".into()), &mut timers)
            .unwrap();
        assert_eq!(s.kind, SettlementKind::Failed(RejectCause::CommitmentRefused));

        for (i, contributor) in ["is-1", "is-2", "is-3"].iter().enumerate() {
            let kind = reveal(&mut registry, &mut timers, contributor, commitments[i].reveal_string(), 2);
            assert_eq!(kind, SettlementKind::RevealRecorded);
        }
        let kind = reveal(&mut registry, &mut timers, "is-4", "00#forged".into(), 2);
        assert_eq!(kind, SettlementKind::Failed(RejectCause::RevealMismatch));
        assert!(notes.calls.lock().is_empty());
        assert_eq!(registry.common_random(), "R6");

        let s = registry.close_epoch("R6", 4, &NodeId::from("is-1")).unwrap();
        assert_eq!(s.kind, SettlementKind::Agreed);
        assert_eq!(s.round.phase(), Phase::Close);
        let seed = registry.common_random();
        assert_eq!(s.new_common_random.as_deref(), Some(seed.as_str()));
        assert_eq!(seed.len(), 16);
        assert_eq!(*notes.calls.lock(), vec![("R6".to_string(), Some(seed))]);
        assert!(registry.epoch().is_none());
        assert!(registry.close_epoch("R6", 4, &NodeId::from("is-1")).is_none());
    }

    #[test]
    fn test_epoch_below_critical_mass_yields_no_value() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        let a = contribute(&mut registry, &mut timers, "is-1", "aa", 1);
        let b = contribute(&mut registry, &mut timers, "is-2", "bb", 1);
        reveal(&mut registry, &mut timers, "is-1", a.reveal_string(), 2);
        reveal(&mut registry, &mut timers, "is-2", b.reveal_string(), 2);

        let s = registry.close_epoch("R6", 4, &NodeId::from("is-1")).unwrap();
        assert_eq!(
            s.kind,
            SettlementKind::Failed(RejectCause::TooFewReveals {
                verified: 2,
                required: 3
            })
        );
        assert_eq!(registry.common_random(), "R6");
        assert_eq!(*notes.calls.lock(), vec![("R6".to_string(), None)]);
    }

    #[test]
    fn test_epoch_overtaken_by_a_direct_agreement_ends_silently() {
        let (mut registry, notes) = setup();
        let mut timers = CountingTimers::default();
        contribute(&mut registry, &mut timers, "is-1", "aa", 1);

        let direct = RoundId::derive("R6", &NodeId::from("is-2"), Phase::Direct, 1);
        start(&mut registry, &direct);
        registry.on_decided(&direct, Outcome::Committed("R7".into()), &mut timers);

        let s = registry.close_epoch("R6", 4, &NodeId::from("is-1")).unwrap();
        assert_eq!(s.kind, SettlementKind::Failed(RejectCause::StalePredecessor));
        assert!(!s.notified);
        assert_eq!(registry.common_random(), "R7");
        assert_eq!(notes.calls.lock().len(), 1);
    }
}
