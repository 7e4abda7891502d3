//! # Secret Chat Core
//!
//! End-to-end encrypted two-party "secret chats" established with an X3DH
//! handshake over an untrusted relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SECRET CHAT CORE MODULES                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        Orchestrator                              │  │
//! │  │  - per-chat state machine      - dedup cache                     │  │
//! │  │  - actor (push + poll)         - send / receive_tick / delete    │  │
//! │  └───────┬──────────────────┬──────────────────┬───────────────┬───┘  │
//! │          │                  │                  │               │      │
//! │  ┌───────▼──────┐  ┌────────▼─────┐  ┌─────────▼────┐  ┌──────▼────┐  │
//! │  │    X3DH      │  │   Session    │  │   Storage    │  │ Transport │  │
//! │  │ - bundles    │  │ - encrypt    │  │ - pre-keys   │  │ - relay   │  │
//! │  │ - init/final │  │ - decrypt    │  │ - key, msgs  │  │ - push    │  │
//! │  └───────┬──────┘  └────────┬─────┘  └──────────────┘  └───────────┘  │
//! │          └─────────┬────────┘                                          │
//! │            ┌───────▼──────┐                                            │
//! │            │    Crypto    │  Ed25519 · X25519 · AES-CTR / ChaCha20    │
//! │            │  (provider)  │  SHA-256 counter KDF                       │
//! │            └──────────────┘                                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Runtime configuration
//! - [`crypto`] - Primitives behind an injectable provider
//! - [`envelope`] - Wire envelopes and packets
//! - [`x3dh`] - Pre-key bundles and the handshake
//! - [`session`] - Post-handshake message codec
//! - [`storage`] - Local persistence of keys and history
//! - [`transport`] - Relay interface and an in-memory relay
//! - [`orchestrator`] - Per-chat state machine and actor
//!
//! ## Security Notes
//!
//! The ciphers are unauthenticated stream ciphers; integrity comes from the
//! Ed25519 signature over every envelope. Every message of a session is
//! encrypted under the same derived key with a random IV, so there is no
//! forward secrecy after the handshake.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod storage;
pub mod time;
pub mod transport;
pub mod x3dh;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::SecretChatConfig;
pub use crypto::{CryptoProvider, KeyPair, Primitives, PublicKey, SessionKey};
pub use envelope::{Envelope, InitEnvelope, Packet, SessionMsgEnvelope};
pub use error::{Error, Result};
pub use orchestrator::{ChatEvent, ChatScope, ChatState, SecretChatHandle, SecretChatSession};
pub use storage::{ChatMember, ChatMessage, ChatRef, FileStore, KeyMaterialStore, SecretChatRecord};
pub use transport::SecretTransport;

// ============================================================================
// CORE INSTANCE
// ============================================================================

use std::sync::Arc;

/// Entry point wiring a provider, a store and a transport together
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                     SECRET CHAT CORE LIFECYCLE                          │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. SecretChatCore::new()      select crypto provider (once)           │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  2. provision_prekeys()        save private half, publish public half  │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  3. create_chat()              chat.json for two members               │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  4. open_chat() → handle       load, send, tick, push, delete          │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  5. handle.shutdown()          stop the chat actor                     │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct SecretChatCore {
    config: SecretChatConfig,
    crypto: Primitives,
    store: Arc<dyn KeyMaterialStore>,
    transport: Arc<dyn SecretTransport>,
}

impl SecretChatCore {
    /// Build a core backed by a [`FileStore`] at `config.storage_root`
    ///
    /// Fails with `EngineUnavailable` if the configured crypto engine does
    /// not exist; the feature should stay disabled in that case.
    pub fn new(config: SecretChatConfig, transport: Arc<dyn SecretTransport>) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.storage_root.clone()));
        Self::with_store(config, store, transport)
    }

    /// Build a core with a custom store
    pub fn with_store(
        config: SecretChatConfig,
        store: Arc<dyn KeyMaterialStore>,
        transport: Arc<dyn SecretTransport>,
    ) -> Result<Self> {
        tracing::info!("Initializing Secret Chat Core v{}", env!("CARGO_PKG_VERSION"));
        let provider = crypto::select_provider(&config.crypto)?;

        Ok(Self {
            config,
            crypto: Primitives::new(provider),
            store,
            transport,
        })
    }

    /// The crypto primitives in use
    pub fn crypto(&self) -> &Primitives {
        &self.crypto
    }

    /// Active configuration
    pub fn config(&self) -> &SecretChatConfig {
        &self.config
    }

    /// Generate, store and publish a new pre-key bundle for `user_id`
    pub async fn provision_prekeys(&self, user_id: &str) -> Result<x3dh::PublishedBundle> {
        orchestrator::provision_prekeys(
            &self.crypto,
            self.transport.as_ref(),
            self.store.as_ref(),
            user_id,
            self.config.one_time_prekey_count,
        )
        .await
    }

    /// Create the record of a two-party chat; `false` if it already exists
    pub async fn create_chat(&self, chat: &ChatRef, name: &str, members: Vec<ChatMember>) -> Result<bool> {
        self.store
            .create_chat(&SecretChatRecord::new(chat, name, members))
            .await
    }

    /// Chats of a group, most recently active first
    pub async fn list_chats(&self, group_id: &str) -> Result<Vec<SecretChatRecord>> {
        self.store.list_chats(group_id).await
    }

    /// Remove a chat with its key and history
    pub async fn delete_chat(&self, chat: &ChatRef) -> Result<()> {
        self.store.delete_chat(chat).await
    }

    /// Unloaded session for `scope`, for callers driving it directly
    pub fn session(&self, scope: ChatScope) -> SecretChatSession {
        SecretChatSession::new(
            self.crypto.clone(),
            self.transport.clone(),
            self.store.clone(),
            scope,
            &self.config,
        )
    }

    /// Spawn a chat actor for `scope` and load it
    pub async fn open_chat(&self, scope: ChatScope) -> Result<SecretChatHandle> {
        let handle = SecretChatHandle::spawn(self.session(scope), &self.config);
        handle.load().await?;
        Ok(handle)
    }
}

impl std::fmt::Debug for SecretChatCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretChatCore")
            .field("config", &self.config)
            .field("crypto", &self.crypto)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Secret Chat Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::OS,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target operating system
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================
