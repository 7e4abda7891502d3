//! # Chat Actor
//!
//! Serializes every entry point of one chat through a single task.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CHAT ACTOR                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                    ┌─────────────────────────┐    │
//! │  │  UI commands    │───┐                │                         │    │
//! │  └─────────────────┘   │   mpsc         │                         │    │
//! │  ┌─────────────────┐   ├───────────────►│   run_chat_loop         │    │
//! │  │  Push listener  │───┘                │                         │    │
//! │  └─────────────────┘                    │  tokio::select! {       │    │
//! │                                          │    cmd = rx.recv()      │    │
//! │  ┌─────────────────┐                    │    _ = poll.tick()      │    │
//! │  │  Poll interval  │───────────────────►│  }                      │    │
//! │  └─────────────────┘                    └───────────┬─────────────┘    │
//! │                                                      │ broadcast        │
//! │                                                      ▼                  │
//! │                                          ┌─────────────────────────┐    │
//! │                                          │  ChatEvent subscribers  │    │
//! │                                          └─────────────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Push and poll can both see the same init packet; because they run one at
//! a time inside the loop, the dedup check and the key install happen per
//! packet without locks.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SecretChatConfig;
use crate::envelope::Packet;
use crate::error::{Error, Result};
use crate::storage::ChatMessage;

use super::chat::SecretChatSession;
use super::ChatState;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

/// Requests handled by the chat loop
#[derive(Debug)]
pub enum ChatCommand {
    /// Open the chat
    Load {
        /// Resulting state
        reply: oneshot::Sender<Result<ChatState>>,
    },
    /// Drain pending packets now
    Tick {
        /// Accepted messages, if the caller wants them
        reply: Option<oneshot::Sender<Result<Vec<ChatMessage>>>>,
    },
    /// A packet from the push subscription
    Push {
        /// The packet
        packet: Packet,
        /// Accepted messages, deferred ones it unblocked included
        reply: Option<oneshot::Sender<Vec<ChatMessage>>>,
    },
    /// Send a message
    Send {
        /// Message text
        text: String,
        /// The locally recorded copy
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    /// Delete messages by id
    Delete {
        /// Ids to remove
        message_ids: Vec<String>,
        /// Remaining messages
        reply: oneshot::Sender<Result<Vec<ChatMessage>>>,
    },
    /// Snapshot of the message list
    Messages {
        /// Messages, oldest first
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    /// Current state
    State {
        /// The state
        reply: oneshot::Sender<ChatState>,
    },
    /// Stop the loop
    Shutdown,
}

/// Notifications emitted by the chat loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// New messages from the other member
    MessagesReceived(Vec<ChatMessage>),
    /// A session key is now held
    Established,
}

/// Drive one chat until shutdown or until every handle is dropped
///
/// `poll_interval` of `None` disables background ticks; polling is skipped
/// until the chat has been loaded.
pub async fn run_chat_loop(
    mut session: SecretChatSession,
    mut command_rx: mpsc::Receiver<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
    poll_interval: Option<Duration>,
) {
    let chat = session.scope().chat.clone();
    tracing::info!(chat = %chat, "Chat loop starting");

    let mut poll = poll_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(cmd) => {
                        if !handle_command(cmd, &mut session, &event_tx).await {
                            tracing::info!(chat = %chat, "Shutdown command received, exiting chat loop");
                            break;
                        }
                    }
                    None => {
                        tracing::info!(chat = %chat, "Command channel closed, exiting chat loop");
                        break;
                    }
                }
            }

            _ = next_poll(&mut poll) => {
                if session.state() == ChatState::NoLocalState {
                    continue;
                }
                let was_established = session.is_established();
                match session.receive_tick().await {
                    Ok(messages) => emit(&event_tx, &session, was_established, messages),
                    Err(e) => tracing::debug!(chat = %chat, error = %e, "Background tick failed"),
                }
            }
        }
    }

    tracing::info!(chat = %chat, "Chat loop stopped");
}

async fn next_poll(poll: &mut Option<tokio::time::Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Returns `false` when the loop should stop
async fn handle_command(
    command: ChatCommand,
    session: &mut SecretChatSession,
    event_tx: &broadcast::Sender<ChatEvent>,
) -> bool {
    let was_established = session.is_established();

    match command {
        ChatCommand::Load { reply } => {
            let result = session.load().await;
            if result.is_ok() {
                emit(event_tx, session, was_established, Vec::new());
            }
            let _ = reply.send(result);
        }

        ChatCommand::Tick { reply } => {
            let result = session.receive_tick().await;
            if let Ok(messages) = &result {
                emit(event_tx, session, was_established, messages.clone());
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }

        ChatCommand::Push { packet, reply } => {
            let accepted = session.handle_push(packet).await;
            emit(event_tx, session, was_established, accepted.clone());
            if let Some(reply) = reply {
                let _ = reply.send(accepted);
            }
        }

        ChatCommand::Send { text, reply } => {
            let result = session.send(&text).await;
            emit(event_tx, session, was_established, Vec::new());
            let _ = reply.send(result);
        }

        ChatCommand::Delete { message_ids, reply } => {
            let _ = reply.send(session.delete(&message_ids).await);
        }

        ChatCommand::Messages { reply } => {
            let _ = reply.send(session.messages().to_vec());
        }

        ChatCommand::State { reply } => {
            let _ = reply.send(session.state());
        }

        ChatCommand::Shutdown => return false,
    }

    true
}

fn emit(
    event_tx: &broadcast::Sender<ChatEvent>,
    session: &SecretChatSession,
    was_established: bool,
    messages: Vec<ChatMessage>,
) {
    // No subscribers is not an error
    if !was_established && session.is_established() {
        let _ = event_tx.send(ChatEvent::Established);
    }
    if !messages.is_empty() {
        let _ = event_tx.send(ChatEvent::MessagesReceived(messages));
    }
}

/// Cloneable handle to a running chat loop
#[derive(Debug, Clone)]
pub struct SecretChatHandle {
    chat_id: String,
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl SecretChatHandle {
    /// Spawn the loop for `session` on the current runtime
    pub fn spawn(session: SecretChatSession, config: &SecretChatConfig) -> Self {
        let chat_id = session.scope().chat.chat_id().to_string();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let poll_interval = (config.poll_interval_ms > 0).then(|| Duration::from_millis(config.poll_interval_ms));

        tokio::spawn(run_chat_loop(session, command_rx, event_tx.clone(), poll_interval));

        Self {
            chat_id,
            command_tx,
            event_tx,
        }
    }

    /// Receive [`ChatEvent`]s from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ChatCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::ActorClosed)?;
        reply_rx.await.map_err(|_| Error::ActorClosed)
    }

    /// Open the chat
    pub async fn load(&self) -> Result<ChatState> {
        self.request(|reply| ChatCommand::Load { reply }).await?
    }

    /// Drain pending packets and return the accepted messages
    pub async fn tick(&self) -> Result<Vec<ChatMessage>> {
        self.request(|reply| ChatCommand::Tick { reply: Some(reply) }).await?
    }

    /// Hand a pushed packet to the loop and wait for every message it
    /// made readable
    pub async fn push(&self, packet: Packet) -> Result<Vec<ChatMessage>> {
        self.request(|reply| ChatCommand::Push {
            packet,
            reply: Some(reply),
        })
        .await
    }

    /// Send a message
    pub async fn send(&self, text: impl Into<String>) -> Result<ChatMessage> {
        let text = text.into();
        self.request(|reply| ChatCommand::Send { text, reply }).await?
    }

    /// Delete messages by id
    pub async fn delete(&self, message_ids: Vec<String>) -> Result<Vec<ChatMessage>> {
        self.request(|reply| ChatCommand::Delete { message_ids, reply }).await?
    }

    /// Snapshot of the message list
    pub async fn messages(&self) -> Result<Vec<ChatMessage>> {
        self.request(|reply| ChatCommand::Messages { reply }).await
    }

    /// Current state
    pub async fn state(&self) -> Result<ChatState> {
        self.request(|reply| ChatCommand::State { reply }).await
    }

    /// Stop the loop; pending commands already queued are still handled
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ChatCommand::Shutdown)
            .await
            .map_err(|_| Error::ActorClosed)
    }

    /// Forward packets for this chat from a push subscription into the loop
    ///
    /// The listener ends when the subscription closes or the loop stops.
    pub fn spawn_push_listener(&self, mut packets: mpsc::UnboundedReceiver<Packet>) -> JoinHandle<()> {
        let chat_id = self.chat_id.clone();
        let command_tx = self.command_tx.clone();

        tokio::spawn(async move {
            while let Some(packet) = packets.recv().await {
                if packet.chat_id != chat_id {
                    continue;
                }
                if command_tx.send(ChatCommand::Push { packet, reply: None }).await.is_err() {
                    break;
                }
            }
            tracing::debug!(chat_id = %chat_id, "Push listener stopped");
        })
    }
}
