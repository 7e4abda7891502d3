//! Per-chat state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::SecretChatConfig;
use crate::crypto::{KeyPair, Primitives, PublicKey, SessionKey};
use crate::envelope::{Envelope, InitEnvelope, Packet, SessionMsgEnvelope};
use crate::error::{Error, Result};
use crate::session;
use crate::storage::{ChatMessage, ChatRef, KeyMaterialStore, SecretChatRecord};
use crate::transport::SecretTransport;
use crate::x3dh::{self, ensure_owner, LocalBundle, PeerBundle, PublishedBundle};

use super::dedup::ProcessedPackets;
use super::{ChatScope, ChatState};

/// One open secret chat
///
/// Not thread-safe on its own; wrap it in a
/// [`SecretChatHandle`](super::SecretChatHandle) to share it between a push
/// listener and a poll loop.
pub struct SecretChatSession {
    crypto: Primitives,
    transport: Arc<dyn SecretTransport>,
    store: Arc<dyn KeyMaterialStore>,
    scope: ChatScope,
    pending_batch_limit: usize,

    state: ChatState,
    record: Option<SecretChatRecord>,
    session_key: Option<SessionKey>,
    local: Option<LocalBundle>,
    bundles: Vec<PublishedBundle>,
    processed: ProcessedPackets,
    messages: Vec<ChatMessage>,

    // Packets that arrived before they could be opened
    deferred: VecDeque<Packet>,
    deferred_capacity: usize,
    // Persistence retried at the start of every tick
    key_unsaved: bool,
    unsaved_messages: Vec<ChatMessage>,
    // History must be rewritten in full, not appended to
    history_dirty: bool,
}

impl SecretChatSession {
    /// Create a session for `scope`; nothing is read until [`load`](Self::load)
    pub fn new(
        crypto: Primitives,
        transport: Arc<dyn SecretTransport>,
        store: Arc<dyn KeyMaterialStore>,
        scope: ChatScope,
        config: &SecretChatConfig,
    ) -> Self {
        Self {
            crypto,
            transport,
            store,
            scope,
            pending_batch_limit: config.pending_batch_limit.max(1),
            state: ChatState::NoLocalState,
            record: None,
            session_key: None,
            local: None,
            bundles: Vec::new(),
            processed: ProcessedPackets::new(config.dedup_capacity),
            messages: Vec::new(),
            deferred: VecDeque::new(),
            deferred_capacity: config.dedup_capacity.max(1),
            key_unsaved: false,
            unsaved_messages: Vec::new(),
            history_dirty: false,
        }
    }

    /// Current state
    pub fn state(&self) -> ChatState {
        self.state
    }

    /// Whether a session key is held
    pub fn is_established(&self) -> bool {
        self.session_key.is_some()
    }

    /// Messages shown to the user, oldest first
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The chat this session serves
    pub fn scope(&self) -> &ChatScope {
        &self.scope
    }

    fn chat(&self) -> &ChatRef {
        &self.scope.chat
    }

    // ========================================================================
    // LOAD
    // ========================================================================

    /// Open the chat: read history and either restore the session key or
    /// prepare the handshake
    ///
    /// A chat without a persisted key requires published bundles, the local
    /// private bundle, and a match between the two. A pending init packet,
    /// if any, is finalized right away.
    pub async fn load(&mut self) -> Result<ChatState> {
        let chat = self.chat().clone();
        let record = self
            .store
            .load_chat(&chat)
            .await?
            .ok_or_else(|| Error::ChatNotFound(chat.to_string()))?;
        self.messages = self.store.load_messages(&chat).await?;
        self.record = Some(record);

        if let Some(key) = self.store.load_session_key(&chat).await? {
            self.session_key = Some(key);
            self.state = ChatState::Established;
            tracing::info!(chat = %chat, messages = self.messages.len(), "Secret chat restored");
            return Ok(self.state);
        }

        self.refresh_bundles().await?;
        if self.bundles.is_empty() {
            return Err(Error::MissingKeyMaterial(format!("No pre-key bundles published for {}", chat)));
        }
        self.check_own_bundle().await?;

        self.state = ChatState::AwaitingFirstSend;
        tracing::info!(chat = %chat, "Secret chat has no session yet");

        if let Err(e) = self.receive_tick().await {
            tracing::warn!(chat = %chat, error = %e, "Initial receive failed, will retry on next tick");
        }
        Ok(self.state)
    }

    async fn check_own_bundle(&mut self) -> Result<()> {
        let user_id = self.scope.user_id.clone();
        let published = self
            .bundles
            .iter()
            .find(|b| b.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::MissingKeyMaterial(format!("{} has not published pre-keys", user_id)))?;

        let local = self.local_bundle().await?;
        if !local.matches_published(&self.crypto, &published)? {
            tracing::warn!(user_id = %user_id, "Local pre-keys do not match the published bundle");
            return Err(Error::MissingKeyMaterial(
                "Local pre-keys do not match the published bundle".into(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // RECEIVE
    // ========================================================================

    /// Pull and process pending packets
    ///
    /// Looks at the shared-secret advertisement first while no session
    /// exists, then drains up to `pending_batch_limit` queued packets.
    /// Individual bad packets are logged and skipped; packets that failed on
    /// storage, transport or missing key material are kept and replayed on
    /// the next tick.
    pub async fn receive_tick(&mut self) -> Result<Vec<ChatMessage>> {
        self.flush_unsaved().await;
        let chat_id = self.chat().chat_id().to_string();
        let mut accepted = Vec::new();

        if !self.is_established() {
            if let Some(packet) = self.transport.fetch_shared_secret_advertisement(&chat_id).await? {
                self.handle_packet(packet, &mut accepted).await;
            }
        }

        for _ in 0..self.pending_batch_limit {
            match self.transport.fetch_pending_packet(&chat_id).await? {
                Some(packet) => self.handle_packet(packet, &mut accepted).await,
                None => break,
            }
        }

        self.retry_deferred(&mut accepted).await;

        if !accepted.is_empty() {
            tracing::debug!(chat_id = %chat_id, count = accepted.len(), "Messages received");
        }
        Ok(accepted)
    }

    /// Process one packet delivered by a push subscription
    ///
    /// Returns every message that became readable, including deferred
    /// packets the new one unblocked.
    pub async fn handle_push(&mut self, packet: Packet) -> Vec<ChatMessage> {
        self.flush_unsaved().await;
        let mut accepted = Vec::new();
        self.handle_packet(packet, &mut accepted).await;
        self.retry_deferred(&mut accepted).await;
        accepted
    }

    async fn handle_packet(&mut self, packet: Packet, accepted: &mut Vec<ChatMessage>) {
        match self.process_packet(packet.clone()).await {
            Ok(Some(message)) => accepted.push(message),
            Ok(None) => {}
            Err(e) if e.is_recoverable() => {
                tracing::warn!(chat = %self.scope.chat, error = %e, "Packet could not be opened yet, will retry");
                self.defer(packet);
            }
            Err(e) => {
                tracing::warn!(chat = %self.scope.chat, error = %e, "Dropping undecodable packet");
            }
        }
    }

    /// Replay deferred packets once each; those still blocked are deferred
    /// again
    async fn retry_deferred(&mut self, accepted: &mut Vec<ChatMessage>) {
        if self.deferred.is_empty() {
            return;
        }
        let deferred: Vec<Packet> = self.deferred.drain(..).collect();
        for packet in deferred {
            self.handle_packet(packet, accepted).await;
        }
    }

    fn defer(&mut self, packet: Packet) {
        if self.deferred.len() == self.deferred_capacity {
            self.deferred.pop_front();
        }
        self.deferred.push_back(packet);
    }

    async fn process_packet(&mut self, packet: Packet) -> Result<Option<ChatMessage>> {
        if packet.chat_id != self.scope.chat.chat_id() || packet.from_user_id == self.scope.user_id {
            return Ok(None);
        }

        let key = packet.envelope.dedup_key();
        if self.processed.contains(&key) {
            tracing::trace!(chat = %self.scope.chat, "Skipping already processed packet");
            return Ok(None);
        }

        let text = match &packet.envelope {
            Envelope::Init(envelope) => self.open_init(&packet, envelope).await?,
            Envelope::Session(envelope) => self.open_session(&packet, envelope).await?,
        };
        let Some(text) = text else {
            return Ok(None);
        };

        self.processed.insert(key);
        let message = ChatMessage::new(text, &packet.from_user_id, &packet.from_user_name, self.chat_name());
        self.record_message(message.clone()).await;
        Ok(Some(message))
    }

    async fn open_init(&mut self, packet: &Packet, envelope: &InitEnvelope) -> Result<Option<String>> {
        if let Some(known) = self.sender_identity(&packet.from_user_id).await? {
            if known.to_raw() != envelope.ik_a_pub {
                tracing::warn!(
                    from = %packet.from_user_id,
                    "Init envelope identity does not match the sender's published bundle"
                );
                return Ok(None);
            }
        }

        let local = self.local_bundle().await?;
        ensure_owner(&local, &self.scope.user_id)?;
        let identity = local.identity(&self.crypto)?;
        let signed_prekey = local.signed_prekey(&self.crypto)?;
        let one_time = match &envelope.used_opk {
            Some(id) => Some(local.one_time_private(&self.crypto, id)?.ok_or_else(|| {
                Error::MissingKeyMaterial(format!("One-time pre-key {} is unknown", id))
            })?),
            None => None,
        };

        let previous = self.state;
        if !self.is_established() {
            self.state = ChatState::FinalizingAsResponder;
        }
        let finalized = match x3dh::finalize_from_envelope(
            &self.crypto,
            &identity,
            &signed_prekey,
            one_time.as_ref(),
            envelope,
        ) {
            Ok(finalized) => finalized,
            Err(e) => {
                self.state = previous;
                return Err(e);
            }
        };

        if !finalized.signature_ok {
            self.state = previous;
            tracing::warn!(from = %packet.from_user_id, "Init envelope signature failed, dropping");
            return Ok(None);
        }

        match self.session_key.as_ref().map(|current| *current == finalized.session_key) {
            Some(false) => {
                tracing::warn!(
                    chat = %self.scope.chat,
                    "Ignoring init envelope for a different session"
                );
                return Ok(None);
            }
            Some(true) => {}
            None => {
                self.install_session_key(finalized.session_key).await;
                tracing::info!(chat = %self.scope.chat, "Session established as responder");
            }
        }

        Ok(Some(finalized.plaintext))
    }

    async fn open_session(&mut self, packet: &Packet, envelope: &SessionMsgEnvelope) -> Result<Option<String>> {
        let Some(session_key) = self.session_key.clone() else {
            tracing::debug!(chat = %self.scope.chat, "Session message before handshake, deferring");
            self.defer(packet.clone());
            return Ok(None);
        };

        let Some(sender) = self.sender_identity(&packet.from_user_id).await? else {
            tracing::debug!(from = %packet.from_user_id, "Sender identity unknown, deferring");
            self.defer(packet.clone());
            return Ok(None);
        };

        let opened = session::decrypt_message(&self.crypto, &session_key, envelope, &sender)?;
        if !opened.signature_ok {
            tracing::warn!(from = %packet.from_user_id, "Session message signature failed, dropping");
            return Ok(None);
        }
        Ok(Some(opened.plaintext))
    }

    // ========================================================================
    // SEND
    // ========================================================================

    /// Encrypt and send `text` to the other member
    ///
    /// The first send of a chat runs the X3DH handshake; later sends use the
    /// session codec. The message is added to the local history once the
    /// relay has accepted it.
    pub async fn send(&mut self, text: &str) -> Result<ChatMessage> {
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }

        let record = self.record().await?;
        let recipient = record
            .other_member(&self.scope.user_id)
            .cloned()
            .ok_or_else(|| Error::RecipientUnresolved(format!("{} has no single other member", self.scope.chat)))?;

        let local = self.local_bundle().await?;
        ensure_owner(&local, &self.scope.user_id)?;
        let identity = local.identity(&self.crypto)?;
        let chat_id = self.scope.chat.chat_id().to_string();
        let to = [recipient.id.clone()];

        match self.session_key.clone() {
            Some(session_key) => {
                let envelope = session::encrypt_message(&self.crypto, &session_key, text, &identity)?;
                let packet = self.packet(Envelope::Session(envelope));
                self.transport.push_envelope(&chat_id, &to, &packet).await?;
            }
            None => {
                let (packet, session_key) = self.build_init(&recipient.id, &identity, text).await?;

                if let Err(e) = self
                    .transport
                    .push_shared_secret_advertisement(&chat_id, &recipient.id, &packet)
                    .await
                {
                    tracing::warn!(chat_id = %chat_id, error = %e, "Failed to advertise shared secret");
                }
                self.transport.push_envelope(&chat_id, &to, &packet).await?;

                self.install_session_key(session_key).await;
                tracing::info!(chat_id = %chat_id, to = %recipient.id, "Session established as initiator");
            }
        }

        let message = ChatMessage::new(text, &self.scope.user_id, &self.scope.user_name, self.chat_name());
        self.record_message(message.clone()).await;
        Ok(message)
    }

    async fn build_init(&mut self, recipient_id: &str, identity: &KeyPair, text: &str) -> Result<(Packet, SessionKey)> {
        let chat_id = self.scope.chat.chat_id().to_string();
        let claimed = self.transport.claim_one_time_prekey(&chat_id, recipient_id).await?;
        if claimed.is_none() {
            tracing::debug!(to = recipient_id, "No one-time pre-key left, continuing without");
        }

        self.refresh_bundles().await?;
        let bundle = self
            .bundles
            .iter()
            .find(|b| b.user_id == recipient_id)
            .cloned()
            .ok_or_else(|| Error::MissingKeyMaterial(format!("{} has not published pre-keys", recipient_id)))?;

        let peer = PeerBundle::from_published(&self.crypto, &bundle, claimed.as_ref())?;
        let outcome = x3dh::build_init_envelope(&self.crypto, identity, &peer, text, None)?;
        if !outcome.peer_signature_valid {
            return Err(Error::SignatureVerificationFailed(format!(
                "Signed pre-key of {} does not verify",
                recipient_id
            )));
        }

        Ok((self.packet(Envelope::Init(outcome.envelope)), outcome.session_key))
    }

    fn packet(&self, envelope: Envelope) -> Packet {
        Packet {
            chat_id: self.scope.chat.chat_id().to_string(),
            from_user_id: self.scope.user_id.clone(),
            from_user_name: self.scope.user_name.clone(),
            envelope,
        }
    }

    // ========================================================================
    // DELETE
    // ========================================================================

    /// Remove messages by id and rewrite the history file
    ///
    /// The in-memory list is updated right away; a failed rewrite is
    /// retried like any other unsaved change.
    pub async fn delete(&mut self, message_ids: &[String]) -> Result<Vec<ChatMessage>> {
        let before = self.messages.len();
        self.messages.retain(|m| !message_ids.contains(&m.id));

        if self.messages.len() != before {
            self.history_dirty = true;
            self.flush_unsaved().await;
            tracing::debug!(chat = %self.scope.chat, removed = before - self.messages.len(), "Messages deleted");
        }
        Ok(self.messages.clone())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn chat_name(&self) -> String {
        self.record.as_ref().map(|r| r.name.clone()).unwrap_or_default()
    }

    async fn record(&mut self) -> Result<SecretChatRecord> {
        if let Some(record) = &self.record {
            return Ok(record.clone());
        }
        let record = self
            .store
            .load_chat(&self.scope.chat)
            .await?
            .ok_or_else(|| Error::ChatNotFound(self.scope.chat.to_string()))?;
        self.record = Some(record.clone());
        Ok(record)
    }

    async fn local_bundle(&mut self) -> Result<LocalBundle> {
        if let Some(local) = &self.local {
            return Ok(local.clone());
        }
        let local = self
            .store
            .load_local_bundle()
            .await?
            .ok_or_else(|| Error::MissingKeyMaterial("No local pre-key bundle".into()))?;
        self.local = Some(local.clone());
        Ok(local)
    }

    async fn refresh_bundles(&mut self) -> Result<()> {
        self.bundles = self.transport.fetch_prekey_bundles(self.scope.chat.chat_id()).await?;
        Ok(())
    }

    /// Identity key of `user_id` from the published bundles, refreshing the
    /// cache once on a miss
    async fn sender_identity(&mut self, user_id: &str) -> Result<Option<PublicKey>> {
        let cached = self.bundles.iter().any(|b| b.user_id == user_id);
        if !cached {
            self.refresh_bundles().await?;
        }

        self.bundles
            .iter()
            .find(|b| b.user_id == user_id)
            .map(|b| self.crypto.import_public_raw(&b.ik_pub))
            .transpose()
    }

    async fn install_session_key(&mut self, key: SessionKey) {
        self.session_key = Some(key);
        self.state = ChatState::Established;
        self.key_unsaved = true;
        self.flush_unsaved().await;
    }

    async fn record_message(&mut self, message: ChatMessage) {
        self.messages.push(message.clone());
        self.unsaved_messages.push(message);
        self.flush_unsaved().await;
    }

    /// Write anything not yet persisted; failures are logged and retried
    /// on the next call
    async fn flush_unsaved(&mut self) {
        let chat = self.scope.chat.clone();

        if self.key_unsaved {
            if let Some(key) = &self.session_key {
                match self.store.save_session_key(&chat, key).await {
                    Ok(()) => self.key_unsaved = false,
                    Err(e) => tracing::warn!(chat = %chat, error = %e, "Failed to persist session key"),
                }
            }
        }

        // A full rewrite already carries every unsaved message
        let written = if self.history_dirty {
            self.store.save_messages(&chat, &self.messages).await
        } else if !self.unsaved_messages.is_empty() {
            self.store.append_messages(&chat, &self.unsaved_messages).await
        } else {
            return;
        };

        match written {
            Ok(()) => {
                self.history_dirty = false;
                self.unsaved_messages.clear();
                if let Err(e) = self.store.touch_chat(&chat).await {
                    tracing::debug!(chat = %chat, error = %e, "Could not bump chat timestamp");
                }
            }
            Err(e) => tracing::warn!(chat = %chat, error = %e, "Failed to persist messages"),
        }
    }
}

impl std::fmt::Debug for SecretChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretChatSession")
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("messages", &self.messages.len())
            .field("processed", &self.processed.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DalekProvider;
    use crate::orchestrator::provision_prekeys;
    use crate::storage::{ChatMember, FileStore};
    use crate::transport::{MemoryRelay, RelayTransport};
    use crate::x3dh::OneTimePublic;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    const CHAT: &str = "chat-1";

    /// File store whose writes can be switched off
    struct FlakyStore {
        inner: FileStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn set_failing(&self, failing: bool) {
            self.fail_writes.store(failing, Ordering::SeqCst);
        }

        fn check_write(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::StorageWriteError("disk full".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyMaterialStore for FlakyStore {
        async fn save_session_key(&self, chat: &ChatRef, key: &SessionKey) -> Result<()> {
            self.check_write()?;
            self.inner.save_session_key(chat, key).await
        }

        async fn load_session_key(&self, chat: &ChatRef) -> Result<Option<SessionKey>> {
            self.inner.load_session_key(chat).await
        }

        async fn append_messages(&self, chat: &ChatRef, messages: &[ChatMessage]) -> Result<()> {
            self.check_write()?;
            self.inner.append_messages(chat, messages).await
        }

        async fn load_messages(&self, chat: &ChatRef) -> Result<Vec<ChatMessage>> {
            self.inner.load_messages(chat).await
        }

        async fn save_messages(&self, chat: &ChatRef, messages: &[ChatMessage]) -> Result<()> {
            self.check_write()?;
            self.inner.save_messages(chat, messages).await
        }

        async fn save_local_bundle(&self, bundle: &LocalBundle) -> Result<()> {
            self.inner.save_local_bundle(bundle).await
        }

        async fn load_local_bundle(&self) -> Result<Option<LocalBundle>> {
            self.inner.load_local_bundle().await
        }

        async fn create_chat(&self, record: &SecretChatRecord) -> Result<bool> {
            self.inner.create_chat(record).await
        }

        async fn load_chat(&self, chat: &ChatRef) -> Result<Option<SecretChatRecord>> {
            self.inner.load_chat(chat).await
        }

        async fn list_chats(&self, group_id: &str) -> Result<Vec<SecretChatRecord>> {
            self.inner.list_chats(group_id).await
        }

        async fn delete_chat(&self, chat: &ChatRef) -> Result<()> {
            self.inner.delete_chat(chat).await
        }

        async fn touch_chat(&self, chat: &ChatRef) -> Result<()> {
            self.check_write()?;
            self.inner.touch_chat(chat).await
        }
    }

    /// Relay client whose next bundle fetches fail
    struct FlakyTransport {
        inner: RelayTransport,
        bundle_failures: AtomicUsize,
    }

    impl FlakyTransport {
        fn fail_bundle_fetches(&self, count: usize) {
            self.bundle_failures.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SecretTransport for FlakyTransport {
        async fn publish_prekey_bundle(&self, bundle: &PublishedBundle) -> Result<()> {
            self.inner.publish_prekey_bundle(bundle).await
        }

        async fn fetch_prekey_bundles(&self, chat_id: &str) -> Result<Vec<PublishedBundle>> {
            let failing = self
                .bundle_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::TransportError("connection reset".into()));
            }
            self.inner.fetch_prekey_bundles(chat_id).await
        }

        async fn claim_one_time_prekey(&self, chat_id: &str, user_id: &str) -> Result<Option<OneTimePublic>> {
            self.inner.claim_one_time_prekey(chat_id, user_id).await
        }

        async fn fetch_pending_packet(&self, chat_id: &str) -> Result<Option<Packet>> {
            self.inner.fetch_pending_packet(chat_id).await
        }

        async fn push_envelope(&self, chat_id: &str, to_user_ids: &[String], packet: &Packet) -> Result<()> {
            self.inner.push_envelope(chat_id, to_user_ids, packet).await
        }

        async fn push_shared_secret_advertisement(&self, chat_id: &str, to_user_id: &str, packet: &Packet) -> Result<()> {
            self.inner.push_shared_secret_advertisement(chat_id, to_user_id, packet).await
        }

        async fn fetch_shared_secret_advertisement(&self, chat_id: &str) -> Result<Option<Packet>> {
            self.inner.fetch_shared_secret_advertisement(chat_id).await
        }
    }

    struct Side {
        user_id: &'static str,
        crypto: Primitives,
        config: SecretChatConfig,
        store: Arc<FlakyStore>,
        transport: Arc<FlakyTransport>,
        _dir: TempDir,
    }

    impl Side {
        async fn new(relay: &MemoryRelay, user_id: &'static str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let crypto = Primitives::new(Arc::new(DalekProvider::default()));
            let config = SecretChatConfig {
                storage_root: dir.path().to_path_buf(),
                ..Default::default()
            };
            let store = Arc::new(FlakyStore {
                inner: FileStore::new(dir.path()),
                fail_writes: AtomicBool::new(false),
            });
            let transport = Arc::new(FlakyTransport {
                inner: relay.connect(user_id),
                bundle_failures: AtomicUsize::new(0),
            });

            provision_prekeys(&crypto, transport.as_ref(), store.as_ref(), user_id, 2)
                .await
                .unwrap();
            let members = vec![
                ChatMember { id: "alice".into(), name: "Alice".into() },
                ChatMember { id: "bob".into(), name: "Bob".into() },
            ];
            store
                .create_chat(&SecretChatRecord::new(&chat(), "Secret", members))
                .await
                .unwrap();

            Self {
                user_id,
                crypto,
                config,
                store,
                transport,
                _dir: dir,
            }
        }

        fn session(&self) -> SecretChatSession {
            SecretChatSession::new(
                self.crypto.clone(),
                self.transport.clone(),
                self.store.clone(),
                ChatScope::new(chat(), self.user_id, self.user_id.to_uppercase()),
                &self.config,
            )
        }

        async fn texts_on_disk(&self) -> Vec<String> {
            let messages = self.store.inner.load_messages(&chat()).await.unwrap();
            messages.into_iter().map(|m| m.text).collect()
        }
    }

    fn chat() -> ChatRef {
        ChatRef::new("group-1", CHAT).unwrap()
    }

    async fn pair() -> (MemoryRelay, Side, Side) {
        let relay = MemoryRelay::new();
        relay.register_chat(CHAT, &["alice", "bob"]);
        let alice = Side::new(&relay, "alice").await;
        let bob = Side::new(&relay, "bob").await;
        (relay, alice, bob)
    }

    fn texts(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_key_and_messages_written_once_after_store_recovers() {
        let (_relay, alice, bob) = pair().await;
        let mut alice_chat = alice.session();
        alice_chat.load().await.unwrap();
        alice_chat.send("hello").await.unwrap();

        bob.store.set_failing(true);
        let mut bob_chat = bob.session();
        assert_eq!(bob_chat.load().await.unwrap(), ChatState::Established);
        assert_eq!(texts(bob_chat.messages()), ["hello"]);
        assert!(bob.store.load_session_key(&chat()).await.unwrap().is_none());
        assert!(bob.texts_on_disk().await.is_empty());

        bob.store.set_failing(false);
        assert!(bob_chat.receive_tick().await.unwrap().is_empty());
        assert_eq!(
            bob.store.load_session_key(&chat()).await.unwrap(),
            alice.store.load_session_key(&chat()).await.unwrap()
        );
        assert_eq!(bob.texts_on_disk().await, ["hello"]);

        bob_chat.receive_tick().await.unwrap();
        assert_eq!(bob.texts_on_disk().await, ["hello"]);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_packet_for_next_tick() {
        let (relay, alice, bob) = pair().await;
        let mut alice_chat = alice.session();
        alice_chat.load().await.unwrap();
        alice_chat.send("hello").await.unwrap();
        bob.session().load().await.unwrap();

        alice_chat.send("important").await.unwrap();

        // Restored chats have no bundles cached yet
        let mut bob_chat = bob.session();
        assert_eq!(bob_chat.load().await.unwrap(), ChatState::Established);
        bob.transport.fail_bundle_fetches(2);

        assert!(bob_chat.receive_tick().await.unwrap().is_empty());
        assert_eq!(relay.pending_count(CHAT, "bob"), 0);

        let received = bob_chat.receive_tick().await.unwrap();
        assert_eq!(texts(&received), ["important"]);
        assert!(bob_chat.receive_tick().await.unwrap().is_empty());
        assert_eq!(texts(bob_chat.messages()), ["hello", "important"]);
        assert_eq!(bob.texts_on_disk().await, ["hello", "important"]);
    }

    #[tokio::test]
    async fn test_delete_after_failed_append_writes_history_once() {
        let (_relay, alice, bob) = pair().await;
        let mut alice_chat = alice.session();
        alice_chat.load().await.unwrap();
        alice_chat.send("first").await.unwrap();
        let mut bob_chat = bob.session();
        bob_chat.load().await.unwrap();
        let first_id = bob_chat.messages()[0].id.clone();

        bob.store.set_failing(true);
        alice_chat.send("second").await.unwrap();
        assert_eq!(texts(&bob_chat.receive_tick().await.unwrap()), ["second"]);
        assert_eq!(bob.texts_on_disk().await, ["first"]);

        bob.store.set_failing(false);
        let remaining = bob_chat.delete(&[first_id]).await.unwrap();
        assert_eq!(texts(&remaining), ["second"]);
        assert_eq!(bob.texts_on_disk().await, ["second"]);

        bob_chat.receive_tick().await.unwrap();
        assert_eq!(bob.texts_on_disk().await, ["second"]);
    }

    #[tokio::test]
    async fn test_failed_delete_is_rewritten_on_next_tick() {
        let (_relay, alice, bob) = pair().await;
        let mut alice_chat = alice.session();
        alice_chat.load().await.unwrap();
        alice_chat.send("first").await.unwrap();
        alice_chat.send("second").await.unwrap();
        let mut bob_chat = bob.session();
        bob_chat.load().await.unwrap();
        assert_eq!(bob.texts_on_disk().await, ["first", "second"]);
        let first_id = bob_chat.messages()[0].id.clone();

        bob.store.set_failing(true);
        let remaining = bob_chat.delete(&[first_id]).await.unwrap();
        assert_eq!(texts(&remaining), ["second"]);
        assert_eq!(bob.texts_on_disk().await, ["first", "second"]);

        bob.store.set_failing(false);
        bob_chat.receive_tick().await.unwrap();
        assert_eq!(bob.texts_on_disk().await, ["second"]);
    }

    #[tokio::test]
    async fn test_push_returns_messages_it_unblocked() {
        let (relay, alice, bob) = pair().await;
        let mut alice_chat = alice.session();
        alice_chat.load().await.unwrap();
        alice_chat.send("hello").await.unwrap();
        alice_chat.send("second").await.unwrap();

        // Take delivery out of the relay so only pushes reach the session
        let inbox = relay.connect("bob");
        assert!(inbox.fetch_shared_secret_advertisement(CHAT).await.unwrap().is_some());
        let init = inbox.fetch_pending_packet(CHAT).await.unwrap().unwrap();
        let follow_up = inbox.fetch_pending_packet(CHAT).await.unwrap().unwrap();
        assert!(matches!(init.envelope, Envelope::Init(_)));

        let mut bob_chat = bob.session();
        assert_eq!(bob_chat.load().await.unwrap(), ChatState::AwaitingFirstSend);

        assert!(bob_chat.handle_push(follow_up).await.is_empty());
        let received = bob_chat.handle_push(init).await;
        assert_eq!(texts(&received), ["hello", "second"]);
        assert_eq!(bob.texts_on_disk().await, ["hello", "second"]);
    }
}
