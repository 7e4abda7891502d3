//! # Storage Module
//!
//! Local persistence of key material and chat history.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ON-DISK LAYOUT                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  <root>/                                                               │
//! │  ├── pre-keys.json                 account-level LocalBundle           │
//! │  └── <group_id>/                                                       │
//! │      └── <chat_id>/                                                    │
//! │          ├── chat.json             SecretChatRecord                    │
//! │          ├── my-keys.json          { "sessionKey": "<hex>" }           │
//! │          └── messages.json         [ChatMessage, ...]                  │
//! │                                                                         │
//! │  A chat is "established" iff my-keys.json exists.                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store is pure persistence: it never derives or validates keys.

mod file_store;
mod records;

pub use file_store::FileStore;
pub use records::{ChatMember, ChatMessage, ChatRef, SecretChatRecord};

use async_trait::async_trait;

use crate::crypto::SessionKey;
use crate::error::Result;
use crate::x3dh::LocalBundle;

/// Persistence seam used by the orchestrator
#[async_trait]
pub trait KeyMaterialStore: Send + Sync {
    /// Persist (or overwrite) the chat's session key
    async fn save_session_key(&self, chat: &ChatRef, key: &SessionKey) -> Result<()>;

    /// Load the chat's session key, `None` if the chat is not established
    async fn load_session_key(&self, chat: &ChatRef) -> Result<Option<SessionKey>>;

    /// Append to the message history
    async fn append_messages(&self, chat: &ChatRef, messages: &[ChatMessage]) -> Result<()>;

    /// Load the message history (empty if none)
    async fn load_messages(&self, chat: &ChatRef) -> Result<Vec<ChatMessage>>;

    /// Replace the message history
    async fn save_messages(&self, chat: &ChatRef, messages: &[ChatMessage]) -> Result<()>;

    /// Persist the device's private pre-key bundle
    async fn save_local_bundle(&self, bundle: &LocalBundle) -> Result<()>;

    /// Load the device's private pre-key bundle
    async fn load_local_bundle(&self) -> Result<Option<LocalBundle>>;

    /// Create a chat record; returns `false` if one already exists
    async fn create_chat(&self, record: &SecretChatRecord) -> Result<bool>;

    /// Load a chat record
    async fn load_chat(&self, chat: &ChatRef) -> Result<Option<SecretChatRecord>>;

    /// All chat records in a group
    async fn list_chats(&self, group_id: &str) -> Result<Vec<SecretChatRecord>>;

    /// Remove a chat and everything stored under it
    async fn delete_chat(&self, chat: &ChatRef) -> Result<()>;

    /// Bump the record's `updated_at`
    async fn touch_chat(&self, chat: &ChatRef) -> Result<()>;
}
