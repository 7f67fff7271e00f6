//! Commit-then-reveal scheme for proposed values
//!
//! A proposer first publishes `hash(random # value)` and only later the
//! reveal string `random # value`, so peers cannot tailor their behaviour
//! to a value they have not yet seen.

use sha2::{Digest, Sha256};

const SEPARATOR: char = '#';

/// A value bound to a random nonce.
///
/// The nonce must not contain `#`; generated nonces are hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    value: String,
    random: String,
}

impl Commitment {
    pub fn new(value: impl Into<String>, random: impl Into<String>) -> Self {
        Commitment {
            value: value.into(),
            random: random.into(),
        }
    }

    /// Bind `value` to a fresh 128-bit nonce.
    pub fn generate(value: impl Into<String>) -> Self {
        Self::new(value, hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn random(&self) -> &str {
        &self.random
    }

    pub fn commitment_string(&self) -> String {
        digest(&self.random, &self.value)
    }

    pub fn reveal_string(&self) -> String {
        format!("{}{}{}", self.random, SEPARATOR, self.value)
    }
}

fn digest(random: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(random.as_bytes());
    hasher.update([SEPARATOR as u8]);
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Recompute the commitment from a revealed pair and compare.
pub fn verify_reveal(commitment: &str, value: &str, random: &str) -> bool {
    digest(random, value) == commitment
}

/// Split a reveal string into `(random, value)` at the first separator.
pub fn parse_reveal(reveal: &str) -> Option<(&str, &str)> {
    reveal.split_once(SEPARATOR)
}

/// Verify a reveal string and return the revealed value on success.
pub fn verify_reveal_string<'a>(commitment: &str, reveal: &'a str) -> Option<&'a str> {
    let (random, value) = parse_reveal(reveal)?;
    verify_reveal(commitment, value, random).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_honest_reveal_verifies() {
        let c = Commitment::new("R7", "5eed");
        assert!(verify_reveal(&c.commitment_string(), "R7", "5eed"));
        assert_eq!(c.reveal_string(), "5eed#R7");
        assert_eq!(
            verify_reveal_string(&c.commitment_string(), &c.reveal_string()),
            Some("R7")
        );
    }

    #[test]
    fn test_tampered_reveal_fails() {
        let c = Commitment::new("R7", "5eed");
        let commitment = c.commitment_string();
        assert!(!verify_reveal(&commitment, "R8", "5eed"));
        assert!(!verify_reveal(&commitment, "R7", "5eee"));
        assert_eq!(verify_reveal_string(&commitment, "5eed#R8"), None);
        assert_eq!(verify_reveal_string(&commitment, "no separator"), None);
    }

    #[test]
    fn test_commitment_hides_value() {
        let c = Commitment::generate("R7");
        let commitment = c.commitment_string();
        assert_eq!(commitment.len(), 64);
        assert!(!commitment.contains("R7"));
        // distinct nonces give distinct commitments for the same value
        assert_ne!(commitment, Commitment::generate("R7").commitment_string());
    }

    #[test]
    fn test_value_may_contain_separator() {
        let c = Commitment::new("a#b", "00ff");
        assert_eq!(parse_reveal(&c.reveal_string()), Some(("00ff", "a#b")));
        assert_eq!(
            verify_reveal_string(&c.commitment_string(), &c.reveal_string()),
            Some("a#b")
        );
    }
}
