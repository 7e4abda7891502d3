//! Remote collaborator interface and an in-process relay.
//!
//! ```text
//!   SecretChatSession ──► SecretTransport ──► relay
//!                                             ├── pre-key directory (+ one-time pools)
//!                                             ├── pending packet queues  (chat, user)
//!                                             ├── shared-secret adverts  (chat, user)
//!                                             └── push subscribers       (user)
//! ```
//!
//! [`MemoryRelay`] implements the relay side in memory. Each user talks to
//! it through a [`RelayTransport`] obtained from [`MemoryRelay::connect`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::envelope::Packet;
use crate::error::{Error, Result};
use crate::x3dh::{OneTimePublic, PublishedBundle};

/// Operations the orchestrator needs from the server
#[async_trait]
pub trait SecretTransport: Send + Sync {
    /// Publish (or replace) the caller's pre-key bundle
    async fn publish_prekey_bundle(&self, bundle: &PublishedBundle) -> Result<()>;

    /// Published bundles of every member of `chat_id`
    async fn fetch_prekey_bundles(&self, chat_id: &str) -> Result<Vec<PublishedBundle>>;

    /// Take one one-time pre-key from `user_id`'s pool; the server forgets it
    async fn claim_one_time_prekey(&self, chat_id: &str, user_id: &str) -> Result<Option<OneTimePublic>>;

    /// Dequeue the next packet addressed to the caller in `chat_id`
    async fn fetch_pending_packet(&self, chat_id: &str) -> Result<Option<Packet>>;

    /// Queue `packet` for each recipient and push it to online ones
    async fn push_envelope(&self, chat_id: &str, to_user_ids: &[String], packet: &Packet) -> Result<()>;

    /// Leave the init packet where the responder looks first on load
    async fn push_shared_secret_advertisement(&self, chat_id: &str, to_user_id: &str, packet: &Packet) -> Result<()>;

    /// Take the advertisement addressed to the caller in `chat_id`
    async fn fetch_shared_secret_advertisement(&self, chat_id: &str) -> Result<Option<Packet>>;
}

type Mailbox = (String, String);

#[derive(Default)]
struct RelayInner {
    bundles: DashMap<String, PublishedBundle>,
    chats: DashMap<String, Vec<String>>,
    queues: DashMap<Mailbox, VecDeque<Packet>>,
    adverts: DashMap<Mailbox, Packet>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Packet>>>,
    offline: AtomicBool,
}

/// In-memory relay shared by any number of [`RelayTransport`] clients
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    /// Empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the members of a chat
    pub fn register_chat(&self, chat_id: &str, member_ids: &[&str]) {
        self.inner
            .chats
            .insert(chat_id.to_string(), member_ids.iter().map(|m| m.to_string()).collect());
    }

    /// Client handle acting as `user_id`
    pub fn connect(&self, user_id: &str) -> RelayTransport {
        RelayTransport {
            relay: self.clone(),
            user_id: user_id.to_string(),
        }
    }

    /// Simulate an outage: every call fails with `TransportError` while set
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining one-time pre-keys of `user_id`
    pub fn one_time_keys_left(&self, user_id: &str) -> usize {
        self.inner
            .bundles
            .get(user_id)
            .map(|b| b.opk_pubs.len())
            .unwrap_or(0)
    }

    /// Packets waiting for `user_id` in `chat_id`
    pub fn pending_count(&self, chat_id: &str, user_id: &str) -> usize {
        self.inner
            .queues
            .get(&(chat_id.to_string(), user_id.to_string()))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(Error::TransportError("relay unreachable".into()));
        }
        Ok(())
    }

    fn is_member(&self, chat_id: &str, user_id: &str) -> bool {
        self.inner
            .chats
            .get(chat_id)
            .map(|members| members.iter().any(|m| m == user_id))
            .unwrap_or(false)
    }

    fn deliver(&self, chat_id: &str, user_id: &str, packet: &Packet) {
        self.inner
            .queues
            .entry((chat_id.to_string(), user_id.to_string()))
            .or_default()
            .push_back(packet.clone());

        if let Some(mut senders) = self.inner.subscribers.get_mut(user_id) {
            senders.retain(|tx| tx.send(packet.clone()).is_ok());
        }
    }
}

/// One user's connection to a [`MemoryRelay`]
#[derive(Clone)]
pub struct RelayTransport {
    relay: MemoryRelay,
    user_id: String,
}

impl RelayTransport {
    /// The user this client acts as
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Live push stream of packets addressed to this user
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.relay
            .inner
            .subscribers
            .entry(self.user_id.clone())
            .or_default()
            .push(tx);
        rx
    }
}

#[async_trait]
impl SecretTransport for RelayTransport {
    async fn publish_prekey_bundle(&self, bundle: &PublishedBundle) -> Result<()> {
        self.relay.check_online()?;
        if bundle.user_id != self.user_id {
            return Err(Error::TransportError(format!(
                "{} cannot publish a bundle for {}",
                self.user_id, bundle.user_id
            )));
        }

        self.relay.inner.bundles.insert(self.user_id.clone(), bundle.clone());
        tracing::debug!(user_id = %self.user_id, one_time_keys = bundle.opk_pubs.len(), "Bundle published");
        Ok(())
    }

    async fn fetch_prekey_bundles(&self, chat_id: &str) -> Result<Vec<PublishedBundle>> {
        self.relay.check_online()?;
        let Some(members) = self.relay.inner.chats.get(chat_id).map(|m| m.value().clone()) else {
            return Ok(Vec::new());
        };

        Ok(members
            .iter()
            .filter_map(|member| self.relay.inner.bundles.get(member).map(|b| b.value().clone()))
            .collect())
    }

    async fn claim_one_time_prekey(&self, chat_id: &str, user_id: &str) -> Result<Option<OneTimePublic>> {
        self.relay.check_online()?;
        if !self.relay.is_member(chat_id, user_id) {
            return Err(Error::TransportError(format!("{} is not a member of {}", user_id, chat_id)));
        }

        let claimed = self.relay.inner.bundles.get_mut(user_id).and_then(|mut bundle| {
            (!bundle.opk_pubs.is_empty()).then(|| bundle.opk_pubs.remove(0))
        });
        tracing::debug!(chat_id, user_id, claimed = claimed.is_some(), "One-time pre-key claim");
        Ok(claimed)
    }

    async fn fetch_pending_packet(&self, chat_id: &str) -> Result<Option<Packet>> {
        self.relay.check_online()?;
        Ok(self
            .relay
            .inner
            .queues
            .get_mut(&(chat_id.to_string(), self.user_id.clone()))
            .and_then(|mut queue| queue.pop_front()))
    }

    async fn push_envelope(&self, chat_id: &str, to_user_ids: &[String], packet: &Packet) -> Result<()> {
        self.relay.check_online()?;
        for user_id in to_user_ids {
            self.relay.deliver(chat_id, user_id, packet);
        }
        Ok(())
    }

    async fn push_shared_secret_advertisement(&self, chat_id: &str, to_user_id: &str, packet: &Packet) -> Result<()> {
        self.relay.check_online()?;
        self.relay
            .inner
            .adverts
            .insert((chat_id.to_string(), to_user_id.to_string()), packet.clone());
        Ok(())
    }

    async fn fetch_shared_secret_advertisement(&self, chat_id: &str) -> Result<Option<Packet>> {
        self.relay.check_online()?;
        Ok(self
            .relay
            .inner
            .adverts
            .remove(&(chat_id.to_string(), self.user_id.clone()))
            .map(|(_, packet)| packet))
    }
}
