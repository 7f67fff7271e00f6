//! Error types for the agreement service

use thiserror::Error;

/// Errors raised while ingesting, processing or persisting agreement traffic.
///
/// None of these is fatal to the process. The worst outcome of any of them
/// is that a round fails to produce a new common random.
#[derive(Debug, Error)]
pub enum AgreementError {
    /// Malformed or undecodable message. Dropped without touching any round.
    #[error("parse error: {0}")]
    Parse(String),

    /// Signature check failed or the claimed sender is unknown.
    #[error("authenticity error from {sender}: {reason}")]
    Authenticity { sender: String, reason: String },

    /// Message references a round in an incompatible state.
    #[error("protocol violation in round {round}: {reason}")]
    ProtocolViolation { round: String, reason: String },

    #[error("timeout: {0}")]
    Timeout(String),

    /// Fewer live participants than the protocol needs.
    #[error("quorum unreachable: {available} participants, {required} required")]
    QuorumUnreachable { available: usize, required: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The dispatcher is gone and can no longer accept events.
    #[error("agreement dispatcher closed")]
    Closed,
}

impl From<serde_json::Error> for AgreementError {
    fn from(err: serde_json::Error) -> Self {
        AgreementError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for AgreementError {
    fn from(err: std::io::Error) -> Self {
        AgreementError::Parse(err.to_string())
    }
}

impl AgreementError {
    pub fn violation(round: impl ToString, reason: impl Into<String>) -> Self {
        AgreementError::ProtocolViolation {
            round: round.to_string(),
            reason: reason.into(),
        }
    }

    pub fn authenticity(sender: impl ToString, reason: impl Into<String>) -> Self {
        AgreementError::Authenticity {
            sender: sender.to_string(),
            reason: reason.into(),
        }
    }

    /// Benign errors are expected under normal operation (duplicates, late
    /// messages) and are logged at debug level only.
    pub fn is_benign(&self) -> bool {
        matches!(self, AgreementError::ProtocolViolation { .. })
    }
}

/// Result type for agreement operations
pub type Result<T> = std::result::Result<T, AgreementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_errors_become_parse_errors() {
        let err: AgreementError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, AgreementError::Parse(_)));
    }

    #[test]
    fn test_only_violations_are_benign() {
        assert!(AgreementError::violation("r", "duplicate").is_benign());
        assert!(!AgreementError::authenticity("is-2", "bad signature").is_benign());
        assert!(!AgreementError::Timeout("round".into()).is_benign());
    }

    #[test]
    fn test_display_mentions_quorum_numbers() {
        let err = AgreementError::QuorumUnreachable {
            available: 2,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "quorum unreachable: 2 participants, 3 required"
        );
    }
}
