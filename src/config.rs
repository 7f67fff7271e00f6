//! Node configuration
//!
//! Values come from the environment (a `.env` file is honoured through
//! `dotenvy`), command line arguments `<node-id> <port>` override the
//! identity and listening port.

use std::str::FromStr;
use std::time::Duration;

use crate::agreement::message::MessageKind;
use crate::agreement::quorum::TimingPolicy;
use crate::agreement::types::{NodeId, ProtocolVariant};
use crate::error::{AgreementError, Result};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_INITIAL_RANDOM: &str = "0000000000000000";

/// One participant as listed in `AGREEMENT_PEERS`: `id@host:port@public-key-hex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: NodeId,
    /// `host:port` of the peer's HTTP endpoint.
    pub address: String,
    pub public_key: Option<String>,
}

impl FromStr for PeerConfig {
    type Err = AgreementError;

    fn from_str(entry: &str) -> Result<Self> {
        let mut parts = entry.trim().splitn(3, '@');
        let id = parts.next().filter(|s| !s.is_empty());
        let address = parts.next().filter(|s| s.contains(':'));
        let (Some(id), Some(address)) = (id, address) else {
            return Err(AgreementError::Config(format!(
                "peer '{}' must look like id@host:port[@public-key]",
                entry
            )));
        };
        Ok(PeerConfig {
            id: NodeId::new(id),
            address: address.to_string(),
            public_key: parts.next().filter(|s| !s.is_empty()).map(str::to_string),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AgreementConfig {
    pub node_id: NodeId,
    pub port: u16,
    /// Every participant, the local node included.
    pub peers: Vec<PeerConfig>,
    /// Hex encoded Ed25519 seed; a fresh key is generated when absent.
    pub signing_key: Option<String>,
    pub variant: ProtocolVariant,
    pub timing: TimingPolicy,
    /// Period of the scheduler contributing to commit-reveal epochs.
    pub interval: Duration,
    pub min_participants: usize,
    pub max_reproposals: u32,
    pub tolerate_unsigned: Vec<MessageKind>,
    pub initial_random: String,
    pub db_path: String,
}

impl AgreementConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = NodeId::new(node_id);
        AgreementConfig {
            db_path: format!("agreement_{}.db", node_id),
            node_id,
            port: DEFAULT_PORT,
            peers: Vec::new(),
            signing_key: None,
            variant: ProtocolVariant::Echo,
            timing: TimingPolicy::for_variant(ProtocolVariant::Echo),
            interval: Duration::from_secs(600),
            min_participants: 3,
            max_reproposals: 1,
            tolerate_unsigned: Vec::new(),
            initial_random: DEFAULT_INITIAL_RANDOM.to_string(),
        }
    }

    /// Switch protocol variant, resetting timing to that variant's defaults.
    pub fn with_variant(mut self, variant: ProtocolVariant) -> Self {
        self.variant = variant;
        self.timing = TimingPolicy::for_variant(variant);
        self
    }

    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup("AGREEMENT_NODE_ID").unwrap_or_else(|| "is-0".to_string());
        let mut config = AgreementConfig::new(node_id);

        if let Some(variant) = parse::<ProtocolVariant, _>(&lookup, "AGREEMENT_VARIANT")? {
            config = config.with_variant(variant);
        }
        if let Some(port) = parse(&lookup, "AGREEMENT_PORT")? {
            config.port = port;
        }
        if let Some(peers) = lookup("AGREEMENT_PEERS") {
            config.peers = peers
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(PeerConfig::from_str)
                .collect::<Result<_>>()?;
        }
        config.signing_key = lookup("AGREEMENT_SIGNING_KEY").filter(|k| !k.trim().is_empty());

        let secs = |key: &str| parse::<u64, _>(&lookup, key).map(|v| v.map(Duration::from_secs));
        if let Some(d) = secs("AGREEMENT_PHASE_TIMEOUT_SECS")? {
            config.timing.phase_timeout = d;
        }
        if let Some(d) = secs("AGREEMENT_PHASE_GAP_SECS")? {
            config.timing.inter_phase_gap = d;
        }
        if let Some(d) = secs("AGREEMENT_ROUND_TIMEOUT_SECS")? {
            config.timing.round_timeout = d;
        }
        if let Some(d) = secs("AGREEMENT_BALLOT_TIMEOUT_SECS")? {
            config.timing.ballot_timeout = d;
        }
        if let Some(d) = secs("AGREEMENT_PASSIVE_PHASE_SECS")? {
            config.timing.passive_phase = d;
        }
        if let Some(d) = secs("AGREEMENT_INTERVAL_SECS")? {
            config.interval = d;
        }

        if let Some(n) = parse(&lookup, "AGREEMENT_MIN_PARTICIPANTS")? {
            config.min_participants = n;
        }
        if let Some(n) = parse(&lookup, "AGREEMENT_MAX_REPROPOSALS")? {
            config.max_reproposals = n;
        }
        if let Some(kinds) = lookup("AGREEMENT_TOLERATE_UNSIGNED") {
            config.tolerate_unsigned = kinds
                .split(',')
                .filter(|k| !k.trim().is_empty())
                .map(|k| MessageKind::from_str(k).map_err(AgreementError::Config))
                .collect::<Result<_>>()?;
        }
        if let Some(random) = lookup("AGREEMENT_INITIAL_RANDOM") {
            config.initial_random = random;
        }
        config.db_path = lookup("AGREEMENT_DB_PATH")
            .unwrap_or_else(|| format!("agreement_{}.db", config.node_id));

        Ok(config)
    }

    /// Apply positional `<node-id> <port>` arguments.
    pub fn with_args(mut self, args: &[String]) -> Result<Self> {
        if let Some(id) = args.first() {
            let renamed_db = self.db_path == format!("agreement_{}.db", self.node_id);
            self.node_id = NodeId::new(id.as_str());
            if renamed_db {
                self.db_path = format!("agreement_{}.db", self.node_id);
            }
        }
        if let Some(port) = args.get(1) {
            self.port = port
                .parse()
                .map_err(|_| AgreementError::Config(format!("invalid port '{}'", port)))?;
        }
        Ok(self)
    }

    /// Sorted participant ids, the local node included even if not listed.
    pub fn participant_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id.clone()).collect();
        if !ids.contains(&self.node_id) {
            ids.push(self.node_id.clone());
        }
        ids.sort();
        ids.dedup();
        ids
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AgreementError::Config(format!("{}: {}", key, e))),
    }
}
