//! Agreement engine implementations
//!
//! - `echo.rs` - Echo broadcast with signed echo proofs
//! - `paxos.rs` - Paxos at war with weak/strong acceptance and ballot freezing

pub mod echo;
pub mod paxos;

pub use echo::EchoEngine;
pub use paxos::PaxosEngine;

use std::time::Duration;

use crate::agreement::traits::AgreementEngine;
use crate::agreement::types::{NodeId, ProtocolVariant, RoundId};

/// Everything an engine needs to know when it is created.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub round: RoundId,
    pub local: NodeId,
    /// Sorted, including the local node.
    pub participants: Vec<NodeId>,
    pub ballot_timeout: Duration,
}

pub fn build_engine(variant: ProtocolVariant, params: EngineParams) -> Box<dyn AgreementEngine> {
    match variant {
        ProtocolVariant::Echo => Box::new(EchoEngine::new(params)),
        ProtocolVariant::Paxos => Box::new(PaxosEngine::new(params)),
    }
}
