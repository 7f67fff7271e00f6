//! Protocol messages for both agreement variants

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agreement::types::{NodeId, RoundId};

/// A protocol message as signed by its sender.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub round: RoundId,
    pub sender: NodeId,
    pub payload: Payload,
}

impl Message {
    pub fn new(round: RoundId, sender: NodeId, payload: Payload) -> Self {
        Message {
            round,
            sender,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Kind-specific content of a message.
///
/// Values are `Option<String>` in the Paxos kinds because a ballot may
/// settle on "no value".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Init {
        proposal: String,
    },
    Echo {
        proposal: String,
    },
    Commit {
        proposal: String,
        echoes: Vec<SignedMessage>,
    },
    Confirmation {
        proposal: String,
        echoes: Vec<SignedMessage>,
    },
    Reject {
        proposal: String,
        last_common_random: String,
    },
    Propose {
        ballot: u32,
        proposal: String,
    },
    Weak {
        ballot: u32,
        value: Option<String>,
    },
    Strong {
        ballot: u32,
        value: Option<String>,
    },
    Decide {
        ballot: u32,
        value: Option<String>,
    },
    Freeze {
        ballot: u32,
    },
    #[serde(rename = "FREEZEPROOF")]
    FreezeProof {
        ballot: u32,
        weak_value: Option<String>,
        strong_value: Option<String>,
    },
    Collect {
        ballot: u32,
        value: Option<String>,
        proofs: Vec<SignedMessage>,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Init { .. } => MessageKind::Init,
            Payload::Echo { .. } => MessageKind::Echo,
            Payload::Commit { .. } => MessageKind::Commit,
            Payload::Confirmation { .. } => MessageKind::Confirmation,
            Payload::Reject { .. } => MessageKind::Reject,
            Payload::Propose { .. } => MessageKind::Propose,
            Payload::Weak { .. } => MessageKind::Weak,
            Payload::Strong { .. } => MessageKind::Strong,
            Payload::Decide { .. } => MessageKind::Decide,
            Payload::Freeze { .. } => MessageKind::Freeze,
            Payload::FreezeProof { .. } => MessageKind::FreezeProof,
            Payload::Collect { .. } => MessageKind::Collect,
        }
    }

    /// Signed messages carried as proof inside this one.
    pub fn embedded(&self) -> &[SignedMessage] {
        match self {
            Payload::Commit { echoes, .. } | Payload::Confirmation { echoes, .. } => echoes,
            Payload::Collect { proofs, .. } => proofs,
            _ => &[],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Init,
    Echo,
    Commit,
    Confirmation,
    Reject,
    Propose,
    Weak,
    Strong,
    Decide,
    Freeze,
    FreezeProof,
    Collect,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Init => "INIT",
            MessageKind::Echo => "ECHO",
            MessageKind::Commit => "COMMIT",
            MessageKind::Confirmation => "CONFIRMATION",
            MessageKind::Reject => "REJECT",
            MessageKind::Propose => "PROPOSE",
            MessageKind::Weak => "WEAK",
            MessageKind::Strong => "STRONG",
            MessageKind::Decide => "DECIDE",
            MessageKind::Freeze => "FREEZE",
            MessageKind::FreezeProof => "FREEZEPROOF",
            MessageKind::Collect => "COLLECT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_uppercase().as_str() {
            "INIT" => MessageKind::Init,
            "ECHO" => MessageKind::Echo,
            "COMMIT" => MessageKind::Commit,
            "CONFIRMATION" => MessageKind::Confirmation,
            "REJECT" => MessageKind::Reject,
            "PROPOSE" => MessageKind::Propose,
            "WEAK" => MessageKind::Weak,
            "STRONG" => MessageKind::Strong,
            "DECIDE" => MessageKind::Decide,
            "FREEZE" => MessageKind::Freeze,
            "FREEZEPROOF" | "FREEZE_PROOF" => MessageKind::FreezeProof,
            "COLLECT" => MessageKind::Collect,
            other => return Err(format!("unknown message kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// A message body exactly as it was signed, plus its hex signature.
///
/// Proofs embedded in COMMIT and COLLECT are kept in this form so the
/// receiver can verify them against the original signer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub body: String,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::types::Phase;

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let round = RoundId::derive("R6", &NodeId::from("is-1"), Phase::Direct, 0);
        let msg = Message::new(
            round,
            NodeId::from("is-1"),
            Payload::FreezeProof {
                ballot: 2,
                weak_value: Some("R7".into()),
                strong_value: None,
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["kind"], "FREEZEPROOF");
        assert_eq!(msg.kind(), MessageKind::FreezeProof);
    }

    #[test]
    fn test_kind_parsing_accepts_both_spellings() {
        assert_eq!("freezeproof".parse(), Ok(MessageKind::FreezeProof));
        assert_eq!("FREEZE_PROOF".parse(), Ok(MessageKind::FreezeProof));
        assert_eq!("echo".parse(), Ok(MessageKind::Echo));
        assert!("HELLO".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_embedded_proofs() {
        let proof = SignedMessage {
            body: "{}".into(),
            signature: "00".into(),
        };
        let commit = Payload::Commit {
            proposal: "R7".into(),
            echoes: vec![proof.clone(), proof],
        };
        assert_eq!(commit.embedded().len(), 2);
        assert!(Payload::Echo { proposal: "R7".into() }.embedded().is_empty());
    }
}
