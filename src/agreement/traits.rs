//! Seams between the agreement core and its collaborators

use tracing::warn;

use crate::agreement::codec::Envelope;
use crate::agreement::types::{
    EngineState, Effect, NodeId, NodeView, RoundId, Settlement, TimerKind,
};
use crate::error::Result;

/// One in-flight agreement instance.
///
/// Both protocol variants implement this trait so a node can be configured
/// to run either. Engines are pure state machines: they return [`Effect`]s
/// and the node performs the I/O.
pub trait AgreementEngine: Send {
    fn round(&self) -> &RoundId;

    fn state(&self) -> &EngineState;

    /// Whether the local node took part, i.e. sent anything for this round.
    fn has_joined(&self) -> bool;

    /// Proposer role: seed the round with `proposal`.
    fn start(&mut self, proposal: &str) -> Vec<Effect>;

    /// Whether the local node vouched for this round's first-phase value
    /// (an ECHO for the echo variant, a ballot-0 WEAK for Paxos).
    fn endorsed(&self) -> bool;

    /// Acceptor role: process one verified message. `view` carries the
    /// node's current common random, used to validate the claimed
    /// predecessor, and whether it may still vouch for a new value.
    fn handle(&mut self, envelope: &Envelope, view: NodeView<'_>) -> Result<Vec<Effect>>;

    fn on_timeout(&mut self, timer: TimerKind) -> Vec<Effect>;

    fn retire(&mut self);
}

/// Membership collaborator. Discovery and connection handling live elsewhere.
pub trait PeerDirectory: Send {
    fn local_id(&self) -> &NodeId;

    /// Every known participant including the local node, sorted.
    fn participants(&self) -> Vec<NodeId>;

    fn number_of_known_peers(&self) -> usize {
        self.participants().len()
    }

    /// Queue bytes for one peer. Must not wait for the peer.
    fn send_to(&self, peer: &NodeId, payload: Vec<u8>) -> Result<()>;

    /// Queue bytes for every participant except the local node.
    fn multicast(&self, payload: Vec<u8>) {
        let local = self.local_id().clone();
        for peer in self.participants().iter().filter(|p| **p != local) {
            if let Err(e) = self.send_to(peer, payload.clone()) {
                warn!(peer = %peer, error = %e, "Multicast: failed to queue message");
            }
        }
    }
}

/// Consumer of agreement outcomes, called on the dispatcher thread.
pub trait AgreementListener: Send + Sync {
    /// Called once per completed round the node took part in; `new` is
    /// `None` when the round produced no new common random.
    fn notify_agreement(&self, old: &str, new: Option<&str>);

    /// Called for every retired round, notified or not.
    fn round_settled(&self, _settlement: &Settlement) {}
}
