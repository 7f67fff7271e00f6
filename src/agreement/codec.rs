//! Message factory: signing, compression and authenticity checks

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

use crate::agreement::message::{Message, MessageKind, SignedMessage};
use crate::agreement::types::NodeId;
use crate::error::{AgreementError, Result};

const SIGNING_DOMAIN: &[u8] = b"infoservice-agreement/v1\n";
const COMPRESSION_LEVEL: i32 = 3;

/// Upper bound on a message, compressed on the wire or once decompressed.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Signature collaborator used by the message factory.
pub trait SignatureService: Send + Sync {
    /// Sign a payload with the local node's key.
    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    /// Verify a signature made by `signer`. Unknown signers never verify.
    fn verify(&self, signer: &NodeId, payload: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 keys for the local node and every known peer.
pub struct Ed25519Keyring {
    local: SigningKey,
    peers: HashMap<NodeId, VerifyingKey>,
}

impl Ed25519Keyring {
    pub fn new(local: SigningKey) -> Self {
        Ed25519Keyring {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::from_bytes(&rand::random::<[u8; 32]>()))
    }

    /// Build from a 32-byte hex encoded secret seed.
    pub fn from_hex(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| AgreementError::Config(format!("signing key: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AgreementError::Config("signing key must be 32 bytes".to_string()))?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.local.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.local.verifying_key()
    }

    pub fn add_peer(&mut self, id: NodeId, key: VerifyingKey) {
        self.peers.insert(id, key);
    }

    pub fn add_peer_hex(&mut self, id: NodeId, key: &str) -> Result<()> {
        let bytes = hex::decode(key.trim())
            .map_err(|e| AgreementError::Config(format!("public key of {}: {}", id, e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            AgreementError::Config(format!("public key of {} must be 32 bytes", id))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AgreementError::Config(format!("public key of {}: {}", id, e)))?;
        self.add_peer(id, key);
        Ok(())
    }
}

impl SignatureService for Ed25519Keyring {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.local.sign(payload).to_bytes().to_vec()
    }

    fn verify(&self, signer: &NodeId, payload: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.peers.get(signer) else {
            return false;
        };
        match Signature::from_slice(signature) {
            Ok(sig) => key.verify(payload, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// Which message kinds may be processed despite a failed signature check.
///
/// Tolerated messages are surfaced with `signature_ok == false` instead of
/// being dropped at decode time. Anyone can forge them in any participant's
/// name, so engines only log them: they count neither toward a decision nor
/// as a sign that the claimed sender has already answered.
#[derive(Debug, Clone, Default)]
pub struct AuthenticityPolicy {
    tolerated: HashSet<MessageKind>,
}

impl AuthenticityPolicy {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn tolerating(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        AuthenticityPolicy {
            tolerated: kinds.into_iter().collect(),
        }
    }

    pub fn tolerates(&self, kind: MessageKind) -> bool {
        self.tolerated.contains(&kind)
    }
}

/// A decoded message together with its verification status.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    pub signature_ok: bool,
    /// Verified proofs carried inside COMMIT, CONFIRMATION and COLLECT.
    pub embedded: Vec<Message>,
    /// The message as signed, for re-embedding as proof.
    pub sealed: SignedMessage,
}

pub struct MessageFactory {
    signer: Arc<dyn SignatureService>,
    policy: AuthenticityPolicy,
}

impl MessageFactory {
    pub fn new(signer: Arc<dyn SignatureService>, policy: AuthenticityPolicy) -> Self {
        MessageFactory { signer, policy }
    }

    /// Serialize and sign a message.
    pub fn seal(&self, message: &Message) -> Result<SignedMessage> {
        let body = serde_json::to_string(message)?;
        let signature = self.signer.sign(&signing_bytes(&body));
        Ok(SignedMessage {
            body,
            signature: hex::encode(signature),
        })
    }

    /// Wire bytes for a sealed message: JSON, then zstd.
    pub fn encode(&self, sealed: &SignedMessage) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(sealed)?;
        zstd::encode_all(&json[..], COMPRESSION_LEVEL)
            .map_err(|e| AgreementError::Transport(format!("compression failed: {}", e)))
    }

    /// Decompress, parse and verify raw bytes received from `from`.
    pub fn decode(&self, from: &NodeId, raw: &[u8]) -> Result<Envelope> {
        let json = decompress(raw)?;
        let sealed: SignedMessage = serde_json::from_slice(&json)?;
        let envelope = self.open(sealed)?;
        if &envelope.message.sender != from {
            return Err(AgreementError::authenticity(
                from,
                format!("transport sender differs from signer {}", envelope.message.sender),
            ));
        }
        Ok(envelope)
    }

    /// Verify and parse a sealed message, including any embedded proofs.
    pub fn open(&self, sealed: SignedMessage) -> Result<Envelope> {
        let (message, signature_ok) = self.verify_sealed(&sealed)?;
        if !signature_ok {
            if !self.policy.tolerates(message.kind()) {
                return Err(AgreementError::authenticity(
                    &message.sender,
                    format!("bad signature on {}", message.kind()),
                ));
            }
            debug!(
                sender = %message.sender,
                kind = %message.kind(),
                "Accepting unauthenticated message for liveness only"
            );
        }

        let mut embedded = Vec::with_capacity(message.payload.embedded().len());
        for proof in message.payload.embedded() {
            let (inner, ok) = self.verify_sealed(proof)?;
            if !ok {
                return Err(AgreementError::authenticity(
                    &inner.sender,
                    format!("bad signature on embedded {}", inner.kind()),
                ));
            }
            embedded.push(inner);
        }

        Ok(Envelope {
            message,
            signature_ok,
            embedded,
            sealed,
        })
    }

    fn verify_sealed(&self, sealed: &SignedMessage) -> Result<(Message, bool)> {
        let message: Message = serde_json::from_str(&sealed.body)?;
        let ok = match hex::decode(&sealed.signature) {
            Ok(signature) => {
                self.signer
                    .verify(&message.sender, &signing_bytes(&sealed.body), &signature)
            }
            Err(_) => false,
        };
        Ok((message, ok))
    }
}

/// Inflate at most [`MAX_MESSAGE_BYTES`]; anything larger is refused
/// before it is fully decompressed.
fn decompress(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() > MAX_MESSAGE_BYTES {
        return Err(AgreementError::Parse(format!("message of {} bytes is too large", raw.len())));
    }
    let mut json = Vec::new();
    zstd::stream::read::Decoder::new(raw)?
        .take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_to_end(&mut json)?;
    if json.len() > MAX_MESSAGE_BYTES {
        return Err(AgreementError::Parse(format!(
            "message inflates beyond {} bytes",
            MAX_MESSAGE_BYTES
        )));
    }
    Ok(json)
}

fn signing_bytes(body: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SIGNING_DOMAIN.len() + body.len());
    bytes.extend_from_slice(SIGNING_DOMAIN);
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::message::Payload;
    use crate::agreement::types::{Phase, RoundId};

    fn keyrings() -> (Arc<Ed25519Keyring>, Arc<Ed25519Keyring>) {
        let mut a = Ed25519Keyring::generate();
        let mut b = Ed25519Keyring::generate();
        let (ka, kb) = (a.verifying_key(), b.verifying_key());
        a.add_peer(NodeId::from("a"), ka);
        a.add_peer(NodeId::from("b"), kb);
        b.add_peer(NodeId::from("a"), ka);
        b.add_peer(NodeId::from("b"), kb);
        (Arc::new(a), Arc::new(b))
    }

    fn echo_from(sender: &str) -> Message {
        Message::new(
            RoundId::derive("R6", &NodeId::from("a"), Phase::Direct, 0),
            NodeId::from(sender),
            Payload::Echo {
                proposal: "R7".into(),
            },
        )
    }

    #[test]
    fn test_decode_verifies_sender_signature() {
        let (a, b) = keyrings();
        let sender = MessageFactory::new(b, AuthenticityPolicy::strict());
        let receiver = MessageFactory::new(a, AuthenticityPolicy::strict());

        let msg = echo_from("b");
        let bytes = sender.encode(&sender.seal(&msg).unwrap()).unwrap();
        let envelope = receiver.decode(&NodeId::from("b"), &bytes).unwrap();

        assert!(envelope.signature_ok);
        assert_eq!(envelope.message, msg);
    }

    #[test]
    fn test_forged_sender_is_rejected() {
        let (a, b) = keyrings();
        // b signs a message claiming to come from a
        let forger = MessageFactory::new(b, AuthenticityPolicy::strict());
        let receiver = MessageFactory::new(a, AuthenticityPolicy::strict());

        let bytes = forger.encode(&forger.seal(&echo_from("a")).unwrap()).unwrap();
        let err = receiver.decode(&NodeId::from("a"), &bytes).unwrap_err();
        assert!(matches!(err, AgreementError::Authenticity { .. }));
    }

    #[test]
    fn test_tolerated_kind_is_flagged_not_dropped() {
        let (a, b) = keyrings();
        let forger = MessageFactory::new(b, AuthenticityPolicy::strict());
        let receiver =
            MessageFactory::new(a, AuthenticityPolicy::tolerating([MessageKind::Echo]));

        let bytes = forger.encode(&forger.seal(&echo_from("a")).unwrap()).unwrap();
        let envelope = receiver.decode(&NodeId::from("a"), &bytes).unwrap();
        assert!(!envelope.signature_ok);
    }

    #[test]
    fn test_transport_sender_must_match_signer() {
        let (a, b) = keyrings();
        let sender = MessageFactory::new(b, AuthenticityPolicy::strict());
        let receiver = MessageFactory::new(a, AuthenticityPolicy::strict());

        let bytes = sender.encode(&sender.seal(&echo_from("b")).unwrap()).unwrap();
        assert!(receiver.decode(&NodeId::from("a"), &bytes).is_err());
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let (a, _) = keyrings();
        let receiver = MessageFactory::new(a, AuthenticityPolicy::strict());

        let err = receiver.decode(&NodeId::from("b"), b"not zstd").unwrap_err();
        assert!(matches!(err, AgreementError::Parse(_)));

        let not_json = zstd::encode_all(&b"{oops"[..], 3).unwrap();
        let err = receiver.decode(&NodeId::from("b"), &not_json).unwrap_err();
        assert!(matches!(err, AgreementError::Parse(_)));
    }

    #[test]
    fn test_oversized_payload_is_refused_while_inflating() {
        let (a, _) = keyrings();
        let receiver = MessageFactory::new(a, AuthenticityPolicy::strict());

        // a few KiB on the wire, far beyond the limit once inflated
        let bomb = zstd::encode_all(&vec![b' '; 8 * MAX_MESSAGE_BYTES][..], 3).unwrap();
        assert!(bomb.len() < MAX_MESSAGE_BYTES / 16);
        let err = receiver.decode(&NodeId::from("b"), &bomb).unwrap_err();
        assert!(matches!(err, AgreementError::Parse(ref m) if m.contains("inflates")), "{}", err);

        let err = receiver
            .decode(&NodeId::from("b"), &vec![0u8; MAX_MESSAGE_BYTES + 1])
            .unwrap_err();
        assert!(matches!(err, AgreementError::Parse(_)));
    }

    #[test]
    fn test_embedded_proofs_are_verified() {
        let (a, b) = keyrings();
        let fa = MessageFactory::new(a.clone(), AuthenticityPolicy::strict());
        let fb = MessageFactory::new(b, AuthenticityPolicy::strict());

        let mut forged = fb.seal(&echo_from("b")).unwrap();
        forged.signature = fa.seal(&echo_from("a")).unwrap().signature;

        let commit = Message::new(
            RoundId::derive("R6", &NodeId::from("a"), Phase::Direct, 0),
            NodeId::from("a"),
            Payload::Commit {
                proposal: "R7".into(),
                echoes: vec![fa.seal(&echo_from("a")).unwrap(), forged],
            },
        );
        let sealed = fa.seal(&commit).unwrap();
        let err = fa.open(sealed).unwrap_err();
        assert!(matches!(err, AgreementError::Authenticity { .. }));
    }

    #[test]
    fn test_keyring_hex_round_trip() {
        let seed = hex::encode([7u8; 32]);
        let keyring = Ed25519Keyring::from_hex(&seed).unwrap();
        let mut other = Ed25519Keyring::generate();
        other
            .add_peer_hex(NodeId::from("x"), &keyring.public_key_hex())
            .unwrap();

        let sig = keyring.sign(b"payload");
        assert!(other.verify(&NodeId::from("x"), b"payload", &sig));
        assert!(!other.verify(&NodeId::from("y"), b"payload", &sig));
        assert!(Ed25519Keyring::from_hex("abcd").is_err());
    }
}
