//! # Orchestrator Module
//!
//! Per-chat state machine tying the handshake, the session codec, storage
//! and the transport together.
//!
//! ## States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CHAT STATES                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  NoLocalState ──(persisted key)────────────────────────► Established   │
//! │       │                                                       ▲         │
//! │       └──(bundles ok, no key)──► AwaitingFirstSend            │         │
//! │                                     │        │                │         │
//! │                        (send: X3DH) │        │ (init packet)  │         │
//! │                                     │        ▼                │         │
//! │                                     │  FinalizingAsResponder ─┘         │
//! │                                     └─────────────────────────┘         │
//! │                                                                         │
//! │  A bad init signature returns to AwaitingFirstSend.                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SecretChatSession`] holds the state; [`SecretChatHandle`] runs it as an
//! actor so push and poll never interleave on the same chat.

mod actor;
mod chat;
mod dedup;

pub use actor::{run_chat_loop, ChatCommand, ChatEvent, SecretChatHandle};
pub use chat::SecretChatSession;
pub use dedup::ProcessedPackets;

use serde::{Deserialize, Serialize};

use crate::crypto::Primitives;
use crate::error::Result;
use crate::storage::{ChatRef, KeyMaterialStore};
use crate::transport::SecretTransport;
use crate::x3dh::{generate_prekey_bundle, PublishedBundle};

/// Who is looking at which chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatScope {
    /// The chat
    pub chat: ChatRef,
    /// Local user id
    pub user_id: String,
    /// Local display name, copied into outgoing packets
    pub user_name: String,
}

impl ChatScope {
    /// Scope for `user_id` in `chat`
    pub fn new(chat: ChatRef, user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            chat,
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Handshake progress of one chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatState {
    /// Nothing loaded yet
    NoLocalState,
    /// No session key; the first send runs the handshake
    AwaitingFirstSend,
    /// An init packet is being finalized
    FinalizingAsResponder,
    /// A session key is held
    Established,
}

/// Generate a fresh pre-key bundle, keep the private half, publish the rest
///
/// The local copy is written before publishing so a published bundle always
/// has its private keys on disk.
pub async fn provision_prekeys(
    crypto: &Primitives,
    transport: &dyn SecretTransport,
    store: &dyn KeyMaterialStore,
    user_id: &str,
    one_time_count: usize,
) -> Result<PublishedBundle> {
    let (published, local) = generate_prekey_bundle(crypto, user_id, one_time_count)?;
    store.save_local_bundle(&local).await?;
    transport.publish_prekey_bundle(&published).await?;

    tracing::info!(
        user_id,
        fingerprint = %published.fingerprint(crypto),
        one_time_keys = published.opk_pubs.len(),
        "Pre-keys provisioned"
    );
    Ok(published)
}
