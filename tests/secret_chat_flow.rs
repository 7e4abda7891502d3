//! End-to-end tests for secret chats over the in-memory relay
//!
//! Covers:
//! - Offline first message and responder finalize
//! - One-time pre-key consumption, and the no-OPK path
//! - Dedup across advertisement, queue and push
//! - Forged bundles, forged packets and mismatched local keys
//! - Persistence, deletion and relay outages

use std::sync::Arc;
use std::time::Duration;

use secret_chat_core::config::SecretChatConfig;
use secret_chat_core::envelope::{Envelope, Packet};
use secret_chat_core::orchestrator::{ChatEvent, ChatScope, ChatState};
use secret_chat_core::session;
use secret_chat_core::storage::{ChatMember, ChatRef, FileStore, KeyMaterialStore};
use secret_chat_core::transport::{MemoryRelay, RelayTransport, SecretTransport};
use secret_chat_core::x3dh::generate_prekey_bundle;
use secret_chat_core::{Error, SecretChatCore};
use tempfile::TempDir;

const GROUP: &str = "group-1";
const CHAT: &str = "chat-1";

struct Party {
    user_id: &'static str,
    name: &'static str,
    core: SecretChatCore,
    store: FileStore,
    transport: RelayTransport,
    _dir: TempDir,
}

impl Party {
    async fn new(relay: &MemoryRelay, user_id: &'static str, name: &'static str, one_time_keys: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = SecretChatConfig {
            storage_root: dir.path().to_path_buf(),
            one_time_prekey_count: one_time_keys,
            poll_interval_ms: 0,
            ..Default::default()
        };
        let transport = relay.connect(user_id);
        let core = SecretChatCore::new(config, Arc::new(transport.clone())).unwrap();
        core.provision_prekeys(user_id).await.unwrap();

        let members = vec![
            ChatMember { id: "alice".into(), name: "Alice".into() },
            ChatMember { id: "bob".into(), name: "Bob".into() },
        ];
        assert!(core.create_chat(&chat(), "Secret", members).await.unwrap());

        Self {
            user_id,
            name,
            core,
            store: FileStore::new(dir.path()),
            transport,
            _dir: dir,
        }
    }

    fn scope(&self) -> ChatScope {
        ChatScope::new(chat(), self.user_id, self.name)
    }

    fn session(&self) -> secret_chat_core::SecretChatSession {
        self.core.session(self.scope())
    }
}

fn chat() -> ChatRef {
    ChatRef::new(GROUP, CHAT).unwrap()
}

async fn pair(bob_one_time_keys: usize) -> (MemoryRelay, Party, Party) {
    let relay = MemoryRelay::new();
    relay.register_chat(CHAT, &["alice", "bob"]);
    let alice = Party::new(&relay, "alice", "Alice", 3).await;
    let bob = Party::new(&relay, "bob", "Bob", bob_one_time_keys).await;
    (relay, alice, bob)
}

#[tokio::test]
async fn test_offline_hello_reaches_bob() {
    let (_relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    assert_eq!(alice_chat.load().await.unwrap(), ChatState::AwaitingFirstSend);
    let sent = alice_chat.send("hello").await.unwrap();
    assert_eq!(alice_chat.state(), ChatState::Established);
    assert_eq!(sent.sender_id, "alice");

    // Bob opens the chat later and finalizes from the advertisement
    let mut bob_chat = bob.session();
    assert_eq!(bob_chat.load().await.unwrap(), ChatState::Established);
    assert_eq!(bob_chat.messages().len(), 1);
    assert_eq!(bob_chat.messages()[0].text, "hello");
    assert_eq!(bob_chat.messages()[0].sender_id, "alice");
    assert_eq!(bob_chat.messages()[0].sender_name, "Alice");

    let alice_key = alice.store.load_session_key(&chat()).await.unwrap().unwrap();
    let bob_key = bob.store.load_session_key(&chat()).await.unwrap().unwrap();
    assert_eq!(alice_key, bob_key);
}

#[tokio::test]
async fn test_one_time_prekey_is_claimed_and_used() {
    let (relay, alice, bob) = pair(3).await;
    let before = bob.transport.fetch_prekey_bundles(CHAT).await.unwrap();
    let first_id = before
        .iter()
        .find(|b| b.user_id == "bob")
        .unwrap()
        .opk_pubs[0]
        .id
        .clone();

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("hello").await.unwrap();
    assert_eq!(relay.one_time_keys_left("bob"), 2);

    let advert = bob.transport.fetch_shared_secret_advertisement(CHAT).await.unwrap().unwrap();
    match &advert.envelope {
        Envelope::Init(init) => assert_eq!(init.used_opk.as_deref(), Some(first_id.as_str())),
        other => panic!("expected init envelope, got {:?}", other),
    }

    // The queued copy still finalizes
    let mut bob_chat = bob.session();
    assert_eq!(bob_chat.load().await.unwrap(), ChatState::Established);
    assert_eq!(bob_chat.messages()[0].text, "hello");
}

#[tokio::test]
async fn test_handshake_without_one_time_prekeys() {
    let (relay, alice, bob) = pair(0).await;
    assert_eq!(relay.one_time_keys_left("bob"), 0);

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("no opk").await.unwrap();

    let mut bob_chat = bob.session();
    assert_eq!(bob_chat.load().await.unwrap(), ChatState::Established);
    assert_eq!(bob_chat.messages()[0].text, "no opk");
}

#[tokio::test]
async fn test_advert_and_queue_copy_append_once() {
    let (relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("once").await.unwrap();
    assert_eq!(relay.pending_count(CHAT, "bob"), 1);

    let mut bob_chat = bob.session();
    bob_chat.load().await.unwrap();
    assert!(bob_chat.receive_tick().await.unwrap().is_empty());

    assert_eq!(relay.pending_count(CHAT, "bob"), 0);
    assert_eq!(bob_chat.messages().len(), 1);
    assert_eq!(bob.store.load_messages(&chat()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_messages_after_handshake() {
    let (_relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("first").await.unwrap();

    let mut bob_chat = bob.session();
    bob_chat.load().await.unwrap();

    for text in ["one", "two", "three"] {
        alice_chat.send(text).await.unwrap();
    }
    let received = bob_chat.receive_tick().await.unwrap();
    let texts: Vec<_> = received.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);

    // And back
    bob_chat.send("hi alice").await.unwrap();
    let received = alice_chat.receive_tick().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].text, "hi alice");
    assert_eq!(received[0].sender_id, "bob");
    assert_eq!(alice_chat.messages().len(), 5);
}

#[tokio::test]
async fn test_pending_batch_is_bounded() {
    let (_relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("start").await.unwrap();
    let mut bob_chat = bob.session();
    bob_chat.load().await.unwrap();

    for i in 0..12 {
        alice_chat.send(&format!("m{}", i)).await.unwrap();
    }
    assert_eq!(bob_chat.receive_tick().await.unwrap().len(), 10);
    assert_eq!(bob_chat.receive_tick().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_forged_signed_prekey_aborts_send() {
    let (relay, alice, bob) = pair(3).await;

    let mut bundle = bob
        .transport
        .fetch_prekey_bundles(CHAT)
        .await
        .unwrap()
        .into_iter()
        .find(|b| b.user_id == "bob")
        .unwrap();
    bundle.spk_sig[0] ^= 0xff;
    bob.transport.publish_prekey_bundle(&bundle).await.unwrap();

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    let err = alice_chat.send("hello").await.unwrap_err();
    assert!(matches!(err, Error::SignatureVerificationFailed(_)));

    assert_eq!(alice_chat.state(), ChatState::AwaitingFirstSend);
    assert!(alice_chat.messages().is_empty());
    assert!(alice.store.load_session_key(&chat()).await.unwrap().is_none());
    assert_eq!(relay.pending_count(CHAT, "bob"), 0);
}

#[tokio::test]
async fn test_forged_session_packet_dropped() {
    let (_relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("hello").await.unwrap();
    let mut bob_chat = bob.session();
    bob_chat.load().await.unwrap();

    // Mallory knows the key but not Alice's identity
    let key = bob.store.load_session_key(&chat()).await.unwrap().unwrap();
    let crypto = alice.core.crypto();
    let mallory = crypto.generate_identity_keypair().unwrap();
    let envelope = session::encrypt_message(crypto, &key, "evil", &mallory).unwrap();
    let packet = Packet {
        chat_id: CHAT.into(),
        from_user_id: "alice".into(),
        from_user_name: "Alice".into(),
        envelope: Envelope::Session(envelope),
    };

    assert!(bob_chat.handle_push(packet).await.is_empty());
    assert_eq!(bob_chat.messages().len(), 1);
}

#[tokio::test]
async fn test_local_prekeys_must_match_published() {
    let (_relay, _alice, bob) = pair(3).await;

    // Rotate the private bundle without publishing it
    let (_, stale) = generate_prekey_bundle(bob.core.crypto(), "bob", 1).unwrap();
    bob.store.save_local_bundle(&stale).await.unwrap();

    let err = bob.session().load().await.unwrap_err();
    assert!(matches!(err, Error::MissingKeyMaterial(_)));
}

#[tokio::test]
async fn test_missing_chat_and_recipient() {
    let (_relay, alice, _bob) = pair(3).await;

    let scope = ChatScope::new(ChatRef::new(GROUP, "nope").unwrap(), "alice", "Alice");
    let err = alice.core.session(scope).load().await.unwrap_err();
    assert!(matches!(err, Error::ChatNotFound(_)));

    let solo = ChatRef::new(GROUP, "solo").unwrap();
    alice
        .core
        .create_chat(&solo, "Solo", vec![ChatMember { id: "alice".into(), name: "Alice".into() }])
        .await
        .unwrap();
    let mut session = alice.core.session(ChatScope::new(solo, "alice", "Alice"));
    let err = session.send("anyone?").await.unwrap_err();
    assert!(matches!(err, Error::RecipientUnresolved(_)));

    let mut alice_chat = alice.session();
    let err = alice_chat.send("   ").await.unwrap_err();
    assert!(matches!(err, Error::EmptyMessage));
}

#[tokio::test]
async fn test_reload_and_delete() {
    let (_relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    alice_chat.send("keep").await.unwrap();
    alice_chat.send("drop").await.unwrap();

    let mut bob_chat = bob.session();
    bob_chat.load().await.unwrap();
    bob_chat.receive_tick().await.unwrap();
    assert_eq!(bob_chat.messages().len(), 2);

    let drop_id = bob_chat.messages()[1].id.clone();
    let remaining = bob_chat.delete(&[drop_id]).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].text, "keep");

    let mut reopened = bob.session();
    assert_eq!(reopened.load().await.unwrap(), ChatState::Established);
    assert_eq!(reopened.messages().len(), 1);

    let listed = bob.core.list_chats(GROUP).await.unwrap();
    assert_eq!(listed.len(), 1);
    bob.core.delete_chat(&chat()).await.unwrap();
    assert!(bob.core.list_chats(GROUP).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_outage_is_recoverable() {
    let (relay, alice, bob) = pair(3).await;

    let mut alice_chat = alice.session();
    alice_chat.load().await.unwrap();
    let mut bob_chat = bob.session();
    bob_chat.load().await.unwrap();

    relay.set_offline(true);
    let err = alice_chat.send("later").await.unwrap_err();
    assert!(err.is_recoverable());
    assert!(alice_chat.messages().is_empty());
    assert!(bob_chat.receive_tick().await.unwrap_err().is_recoverable());

    relay.set_offline(false);
    alice_chat.send("now").await.unwrap();
    let received = bob_chat.receive_tick().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].text, "now");
}

#[tokio::test]
async fn test_actor_push_and_poll_race() {
    let (_relay, alice, bob) = pair(3).await;

    let bob_handle = bob.core.open_chat(bob.scope()).await.unwrap();
    assert_eq!(bob_handle.state().await.unwrap(), ChatState::AwaitingFirstSend);
    let mut events = bob_handle.subscribe_events();
    let listener = bob_handle.spawn_push_listener(bob.transport.subscribe());

    let alice_handle = alice.core.open_chat(alice.scope()).await.unwrap();
    alice_handle.send("hello").await.unwrap();
    alice_handle.send("again").await.unwrap();

    // Poll while pushes are in flight
    bob_handle.tick().await.unwrap();

    let mut received = 0;
    let mut established = false;
    while received < 2 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ChatEvent::MessagesReceived(messages))) => received += messages.len(),
            Ok(Ok(ChatEvent::Established)) => established = true,
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(established);

    bob_handle.tick().await.unwrap();
    let messages = bob_handle.messages().await.unwrap();
    let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["hello", "again"]);
    assert_eq!(bob.store.load_messages(&chat()).await.unwrap().len(), 2);

    bob_handle.shutdown().await.unwrap();
    alice_handle.shutdown().await.unwrap();
    listener.abort();
    assert!(matches!(bob_handle.state().await, Err(Error::ActorClosed)));
}
