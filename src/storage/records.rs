//! Persisted record types.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::now_rfc3339;

/// Location of a chat on disk: `{root}/{group_id}/{chat_id}`
///
/// Both ids are validated on every construction path, deserialization
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawChatRef")]
pub struct ChatRef {
    group_id: String,
    chat_id: String,
}

impl ChatRef {
    /// Build a reference, rejecting ids that are not plain path components
    pub fn new(group_id: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let chat = Self {
            group_id: group_id.into(),
            chat_id: chat_id.into(),
        };
        check_component(&chat.group_id)?;
        check_component(&chat.chat_id)?;
        Ok(chat)
    }

    /// Owning group (workspace) id
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Chat id
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChatRef {
    group_id: String,
    chat_id: String,
}

impl TryFrom<RawChatRef> for ChatRef {
    type Error = Error;

    fn try_from(raw: RawChatRef) -> Result<Self> {
        ChatRef::new(raw.group_id, raw.chat_id)
    }
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.chat_id)
    }
}

pub(crate) fn check_component(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::StorageWriteError(format!("Invalid chat path component '{}'", id)))
    }
}

/// A participant of a secret chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMember {
    /// User id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// Local record of a secret chat (`chat.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretChatRecord {
    /// Chat id
    pub id: String,
    /// Owning group id
    pub group_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Both participants, the local user included
    pub members: Vec<ChatMember>,
    /// RFC 3339 creation time
    pub created_at: String,
    /// RFC 3339 time of the last persisted change
    pub updated_at: String,
}

impl SecretChatRecord {
    /// New record stamped with the current time
    pub fn new(chat: &ChatRef, name: impl Into<String>, members: Vec<ChatMember>) -> Self {
        let now = now_rfc3339();
        Self {
            id: chat.chat_id().to_string(),
            group_id: chat.group_id().to_string(),
            name: name.into(),
            members,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Where this record lives
    pub fn chat_ref(&self) -> Result<ChatRef> {
        ChatRef::new(self.group_id.clone(), self.id.clone())
    }

    /// The single member that is not `own_user_id`
    pub fn other_member(&self, own_user_id: &str) -> Option<&ChatMember> {
        let mut others = self.members.iter().filter(|m| m.id != own_user_id);
        match (others.next(), others.next()) {
            (Some(member), None) => Some(member),
            _ => None,
        }
    }
}

/// A decrypted message as stored in `messages.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique id (UUID v4)
    pub id: String,
    /// Message text
    pub text: String,
    /// Sender user id
    pub sender_id: String,
    /// Sender display name
    #[serde(default)]
    pub sender_name: String,
    /// Chat display name at the time of receipt
    #[serde(default)]
    pub chat_name: String,
    /// RFC 3339 creation time
    pub created_at: String,
    /// Whether the text was edited after sending
    #[serde(default)]
    pub is_edited: bool,
}

impl ChatMessage {
    /// New message with a fresh id and the current time
    pub fn new(
        text: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        chat_name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            chat_name: chat_name.into(),
            created_at: now_rfc3339(),
            is_edited: false,
        }
    }
}
