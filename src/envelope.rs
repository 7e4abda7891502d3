//! Wire model exchanged through the relay.
//!
//! ```text
//! Packet
//! ├── chatId, fromUserId, fromUserName
//! └── envelope ── kind = "init"    → InitEnvelope
//!               └ kind = "session" → SessionMsgEnvelope
//! ```
//!
//! Binary fields travel as lowercase hex.

use serde::{Deserialize, Serialize};

use crate::crypto::hex_vec;

/// Associated data prefix of an init envelope signature
pub const INIT_AAD: &[u8] = b"X3DHv1";

/// Associated data prefix of a session message signature
pub const SESSION_AAD: &[u8] = b"MSGv1";

/// First message of a chat: carries the initiator's public X3DH parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitEnvelope {
    /// Initiator identity public key (raw)
    #[serde(rename = "ikAPub", with = "hex_vec")]
    pub ik_a_pub: Vec<u8>,
    /// Initiator ephemeral public key (raw)
    #[serde(rename = "ekAPub", with = "hex_vec")]
    pub ek_a_pub: Vec<u8>,
    /// Id of the responder's one-time pre-key used, if any
    #[serde(rename = "usedOpk")]
    pub used_opk: Option<String>,
    /// Per-session salt
    #[serde(with = "hex_vec")]
    pub ukm: Vec<u8>,
    /// Cipher IV
    #[serde(with = "hex_vec")]
    pub iv: Vec<u8>,
    /// Ciphertext of the first message
    #[serde(with = "hex_vec")]
    pub ct: Vec<u8>,
    /// Identity signature over `INIT_AAD ‖ ik_a_pub ‖ ek_a_pub ‖ iv ‖ ct`
    #[serde(with = "hex_vec")]
    pub sig: Vec<u8>,
}

impl InitEnvelope {
    /// Bytes covered by `sig`
    pub fn signed_bytes(&self) -> Vec<u8> {
        init_signed_bytes(&self.ik_a_pub, &self.ek_a_pub, &self.iv, &self.ct)
    }
}

pub(crate) fn init_signed_bytes(ik_pub: &[u8], ek_pub: &[u8], iv: &[u8], ct: &[u8]) -> Vec<u8> {
    [INIT_AAD, ik_pub, ek_pub, iv, ct].concat()
}

/// Post-handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMsgEnvelope {
    /// Cipher IV
    #[serde(with = "hex_vec")]
    pub iv: Vec<u8>,
    /// Ciphertext
    #[serde(with = "hex_vec")]
    pub ct: Vec<u8>,
    /// Identity signature over `SESSION_AAD ‖ iv ‖ ct`
    #[serde(with = "hex_vec")]
    pub sig: Vec<u8>,
}

impl SessionMsgEnvelope {
    /// Bytes covered by `sig`
    pub fn signed_bytes(&self) -> Vec<u8> {
        session_signed_bytes(&self.iv, &self.ct)
    }
}

pub(crate) fn session_signed_bytes(iv: &[u8], ct: &[u8]) -> Vec<u8> {
    [SESSION_AAD, iv, ct].concat()
}

/// Either kind of envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// Handshake envelope
    Init(InitEnvelope),
    /// Session message
    Session(SessionMsgEnvelope),
}

impl Envelope {
    /// Identity of this envelope for duplicate suppression
    pub fn dedup_key(&self) -> DedupKey {
        let (iv, sig) = match self {
            Envelope::Init(env) => (&env.iv, &env.sig),
            Envelope::Session(env) => (&env.iv, &env.sig),
        };
        DedupKey {
            iv: iv.clone(),
            sig: sig.clone(),
        }
    }

    /// True for handshake envelopes
    pub fn is_init(&self) -> bool {
        matches!(self, Envelope::Init(_))
    }
}

/// `(iv, signature)` pair identifying a processed packet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    iv: Vec<u8>,
    sig: Vec<u8>,
}

/// A delivered envelope with routing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Chat the envelope belongs to
    pub chat_id: String,
    /// Sender user id
    pub from_user_id: String,
    /// Sender display name
    #[serde(default)]
    pub from_user_name: String,
    /// Payload
    pub envelope: Envelope,
}
