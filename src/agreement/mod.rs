//! Periodic agreement on a common random among InfoServices
//!
//! ## Structure
//! - `types.rs` - Identifiers, outcomes and engine effects
//! - `message.rs` - Protocol messages of both variants
//! - `codec.rs` - Signing, compression and authenticity checks
//! - `commitment.rs` - Commit-reveal scheme
//! - `epoch.rs` - Multi-contributor commit-reveal epochs
//! - `quorum.rs` - Quorum thresholds and timing policy
//! - `reject.rs` - Reject bookkeeping at the initiator
//! - `traits.rs` - Engine, peer directory and listener seams
//! - `engines/` - Echo and Paxos engines
//! - `registry.rs` - Live and retired rounds, the common random
//! - `proposer.rs` - Proposer role and commitment sessions
//! - `queue.rs` - Inbound queue and the single dispatcher
//! - `timer.rs` - Timers feeding the dispatcher
//! - `node.rs` - Everything wired together
//! - `tests.rs` - Multi-node scenarios

pub use codec::{AuthenticityPolicy, Ed25519Keyring, Envelope, MessageFactory, SignatureService};
pub use commitment::Commitment;
pub use epoch::Epoch;
pub use engines::{build_engine, EchoEngine, EngineParams, PaxosEngine};
pub use message::{Message, MessageKind, Payload, SignedMessage};
pub use node::Node;
pub use queue::{channel, Dispatcher, Event, EventHandler, Inbox, Ingress};
pub use quorum::{QuorumPolicy, TimingPolicy};
pub use registry::{Registry, SeedHandle};
pub use timer::{TimerService, TokioTimers};
pub use traits::{AgreementEngine, AgreementListener, PeerDirectory};
pub use types::{
    NodeId, NodeView, Outcome, Phase, ProtocolVariant, RejectCause, RoundId, Settlement, SettlementKind,
};

pub mod codec;
pub mod commitment;
pub mod engines;
pub mod epoch;
pub mod message;
pub mod node;
pub mod proposer;
pub mod queue;
pub mod quorum;
pub mod registry;
pub mod reject;
pub mod timer;
pub mod traits;
pub mod types;
