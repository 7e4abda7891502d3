//! JSON-file implementation of [`KeyMaterialStore`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::records::check_component;
use super::{ChatMessage, ChatRef, KeyMaterialStore, SecretChatRecord};
use crate::crypto::SessionKey;
use crate::error::{Error, Result};
use crate::time::now_rfc3339;
use crate::x3dh::LocalBundle;

const PRE_KEYS_FILE: &str = "pre-keys.json";
const CHAT_FILE: &str = "chat.json";
const KEYS_FILE: &str = "my-keys.json";
const MESSAGES_FILE: &str = "messages.json";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSessionKey {
    session_key: String,
}

/// Stores everything as pretty-printed JSON under a root directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Store rooted at `root`; directories are created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chat_dir(&self, chat: &ChatRef) -> PathBuf {
        self.root.join(chat.group_id()).join(chat.chat_id())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StorageReadError(format!("{}: {}", path.display(), e))),
        }
    }

    /// Write through a sibling temp file so readers never see half a file
    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let write_err = |e: std::io::Error| Error::StorageWriteError(format!("{}: {}", path.display(), e));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await.map_err(write_err)?;
        fs::rename(&tmp, path).await.map_err(write_err)?;
        Ok(())
    }
}

#[async_trait]
impl KeyMaterialStore for FileStore {
    async fn save_session_key(&self, chat: &ChatRef, key: &SessionKey) -> Result<()> {
        let stored = StoredSessionKey {
            session_key: key.to_hex(),
        };
        Self::write_json(&self.chat_dir(chat).join(KEYS_FILE), &stored).await?;
        tracing::debug!(chat = %chat, "Session key persisted");
        Ok(())
    }

    async fn load_session_key(&self, chat: &ChatRef) -> Result<Option<SessionKey>> {
        let stored: Option<StoredSessionKey> = Self::read_json(&self.chat_dir(chat).join(KEYS_FILE)).await?;
        stored
            .map(|s| SessionKey::from_hex(&s.session_key))
            .transpose()
    }

    async fn append_messages(&self, chat: &ChatRef, messages: &[ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut history = self.load_messages(chat).await?;
        history.extend_from_slice(messages);
        self.save_messages(chat, &history).await
    }

    async fn load_messages(&self, chat: &ChatRef) -> Result<Vec<ChatMessage>> {
        Ok(Self::read_json(&self.chat_dir(chat).join(MESSAGES_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn save_messages(&self, chat: &ChatRef, messages: &[ChatMessage]) -> Result<()> {
        Self::write_json(&self.chat_dir(chat).join(MESSAGES_FILE), messages).await
    }

    async fn save_local_bundle(&self, bundle: &LocalBundle) -> Result<()> {
        Self::write_json(&self.root.join(PRE_KEYS_FILE), bundle).await?;
        tracing::info!(user_id = %bundle.user_id, "Local pre-key bundle saved");
        Ok(())
    }

    async fn load_local_bundle(&self) -> Result<Option<LocalBundle>> {
        Self::read_json(&self.root.join(PRE_KEYS_FILE)).await
    }

    async fn create_chat(&self, record: &SecretChatRecord) -> Result<bool> {
        let chat = record.chat_ref()?;
        let path = self.chat_dir(&chat).join(CHAT_FILE);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }

        Self::write_json(&path, record).await?;
        tracing::info!(chat = %chat, "Secret chat created");
        Ok(true)
    }

    async fn load_chat(&self, chat: &ChatRef) -> Result<Option<SecretChatRecord>> {
        Self::read_json(&self.chat_dir(chat).join(CHAT_FILE)).await
    }

    async fn list_chats(&self, group_id: &str) -> Result<Vec<SecretChatRecord>> {
        check_component(group_id)?;
        let group_dir = self.root.join(group_id);

        let mut entries = match fs::read_dir(&group_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::StorageReadError(format!("{}: {}", group_dir.display(), e))),
        };

        let mut chats = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(CHAT_FILE);
            match Self::read_json::<SecretChatRecord>(&path).await {
                Ok(Some(record)) => chats.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable chat record");
                }
            }
        }

        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn delete_chat(&self, chat: &ChatRef) -> Result<()> {
        match fs::remove_dir_all(self.chat_dir(chat)).await {
            Ok(()) => {
                tracing::info!(chat = %chat, "Secret chat deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StorageWriteError(e.to_string())),
        }
    }

    async fn touch_chat(&self, chat: &ChatRef) -> Result<()> {
        let mut record = self
            .load_chat(chat)
            .await?
            .ok_or_else(|| Error::ChatNotFound(chat.to_string()))?;
        record.updated_at = now_rfc3339();
        Self::write_json(&self.chat_dir(chat).join(CHAT_FILE), &record).await
    }
}
