//! InfoService agreement: periodic quorum consensus on a common random seed

pub mod agreement;
pub mod config;
pub mod error;
pub mod logger;
pub mod network;
pub mod store;

pub use agreement::{Node, NodeId, ProtocolVariant, SeedHandle};
pub use config::AgreementConfig;
pub use error::{AgreementError, Result};
pub use store::{AgreementStore, HistoryListener};
