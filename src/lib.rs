//! Real-time chat subsystem for the Ciarla social client.
//!
//! Owns the long-lived websocket transport, presence roster, per-conversation
//! messaging (history backlog merged with the live stream) and the voice
//! message recording pipeline. The surrounding UI and the REST CRUD screens
//! (profiles, feed, connections) live outside this crate.

pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod history;
pub mod merge;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod recording;

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::oneshot;

use crate::config::ChatConfig;
use crate::connection::{ConnectionManager, SessionCredentials};
use crate::conversation::{ConversationChannel, RoomSubscription};
use crate::error::ChatError;
use crate::history::HistoryLoader;
use crate::merge::MessageMerger;
use crate::models::{ConversationId, Message};
use crate::presence::PresenceTracker;
use crate::recording::{AudioCapture, HttpClipUploader, RecordingPipeline};

/// Initialize logging for embedders that carry no logger of their own.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    use std::io::Write;
    let _ = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Top-level wiring: one transport connection shared by presence and every
/// conversation, injected rather than reached for as a global.
pub struct ChatClient {
    config: ChatConfig,
    connection: Arc<ConnectionManager>,
    presence: PresenceTracker,
    history: HistoryLoader,
    presence_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Shared by every channel this client vends, so opening a conversation
    /// revokes the previously vended view, not just the previous join on the
    /// same channel.
    room_generation: Arc<AtomicU64>,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Self {
        let connection = Arc::new(ConnectionManager::new(config.clone()));
        let history = HistoryLoader::new(&config.api_base_url);
        Self {
            config,
            connection,
            presence: PresenceTracker::new(),
            history,
            presence_task: Mutex::new(None),
            room_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        self.connection.as_ref()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Establish the transport with an already-issued session credential and
    /// start tracking presence.
    pub async fn connect(&self, credentials: &SessionCredentials) -> anyhow::Result<()> {
        self.connection.open(credentials).await?;
        let mut guard = self.presence_task.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.presence.attach(self.connection.handle()));
        }
        Ok(())
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Open the chat view for `target_user_id`: join the room and kick off the
    /// one-shot backlog fetch. The two race; the view's merger reconciles.
    /// Any view vended earlier goes mute; at most one conversation is live
    /// per client.
    pub fn open_conversation(&self, target_user_id: &str) -> Result<ConversationView, ChatError> {
        let self_id = self
            .connection
            .authenticated_user()
            .ok_or_else(|| ChatError::Connection("not connected".to_string()))?;

        let mut channel = ConversationChannel::with_generation(
            self.connection.handle(),
            self_id,
            self.room_generation.clone(),
        );
        let subscription = channel.join(target_user_id)?;
        let conversation_id = subscription.conversation_id.clone();

        let (history_tx, history_rx) = oneshot::channel();
        let loader = self.history.clone();
        let fetch_id = conversation_id.clone();
        tokio::spawn(async move {
            // If the view closed meanwhile the receiver is gone and the
            // result is simply discarded.
            let _ = history_tx.send(loader.load(&fetch_id).await);
        });

        Ok(ConversationView {
            conversation_id,
            channel,
            subscription,
            merger: MessageMerger::new(),
            history_rx: Some(history_rx),
        })
    }

    /// Build a voice-message pipeline over the platform capture device.
    pub fn recording_pipeline<C: AudioCapture>(
        &self,
        capture: C,
    ) -> RecordingPipeline<C, HttpClipUploader> {
        RecordingPipeline::new(capture, HttpClipUploader::new(&self.config.upload_url))
    }
}

/// One open conversation: live subscription, backlog fetch and merged view.
/// Dropping the view revokes the subscription and orphans any in-flight
/// fetch, so late results never land on a stale screen.
pub struct ConversationView {
    pub conversation_id: ConversationId,
    channel: ConversationChannel,
    subscription: RoomSubscription,
    merger: MessageMerger,
    history_rx: Option<oneshot::Receiver<Result<Vec<Message>, ChatError>>>,
}

impl ConversationView {
    /// Wait for the next input (backlog result or live message) and fold it
    /// into the view. Returns `false` once the live feed has ended.
    pub async fn tick(&mut self) -> bool {
        if let Some(mut history_rx) = self.history_rx.take() {
            tokio::select! {
                result = &mut history_rx => {
                    match result {
                        Ok(Ok(backlog)) => self.merger.resolve_history(backlog),
                        Ok(Err(e)) => {
                            warn!("[CHAT] History fetch failed for {}: {}", self.conversation_id, e);
                            self.merger.history_failed();
                        }
                        Err(_) => self.merger.history_failed(),
                    }
                    true
                }
                message = self.subscription.recv() => {
                    match message {
                        Some(message) => {
                            self.merger.push_live(message);
                            self.history_rx = Some(history_rx);
                            true
                        }
                        None => {
                            self.history_rx = Some(history_rx);
                            false
                        }
                    }
                }
            }
        } else {
            match self.subscription.recv().await {
                Some(message) => {
                    self.merger.push_live(message);
                    true
                }
                None => false,
            }
        }
    }

    /// The canonical merged view, oldest first.
    pub fn messages(&self) -> &[Message] {
        self.merger.view()
    }

    /// Optimistic text send: the local echo lands in the view immediately and
    /// is reconciled against the server echo by correlation id.
    pub fn send_text(&mut self, text: &str) -> Result<Message, ChatError> {
        let local = self.channel.send_text(text)?;
        self.merger.push_live(local.clone());
        Ok(local)
    }

    /// Used by the recording pipeline's handoff (and directly by callers that
    /// already hold a clip URL).
    pub fn channel(&self) -> &ConversationChannel {
        &self.channel
    }

    pub fn record_audio_message(&mut self, message: Message) {
        self.merger.push_live(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, ConnectionState};
    use crate::models::MessageKind;
    use crate::protocol::ServerEvent;
    use tokio::sync::{broadcast, mpsc};

    // Callers keep the returned receiver alive so sends keep succeeding.
    fn view_with_pending_history(
        events_tx: &broadcast::Sender<ServerEvent>,
        history_rx: oneshot::Receiver<Result<Vec<Message>, ChatError>>,
    ) -> (ConversationView, mpsc::UnboundedReceiver<crate::protocol::ClientEvent>) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let handle =
            ConnectionHandle::for_tests(events_tx.clone(), outbox_tx, ConnectionState::Connected);
        let mut channel = ConversationChannel::new(handle, "alice".to_string());
        let subscription = channel.join("bob").unwrap();
        let conversation_id = subscription.conversation_id.clone();
        let view = ConversationView {
            conversation_id,
            channel,
            subscription,
            merger: MessageMerger::new(),
            history_rx: Some(history_rx),
        };
        (view, outbox_rx)
    }

    fn message_in(room: &ConversationId, id: &str, created_at: i64) -> Message {
        Message {
            id: Some(id.to_string()),
            correlation_id: None,
            conversation_id: room.clone(),
            sender_id: "bob".to_string(),
            kind: MessageKind::Text,
            text: Some(format!("msg-{}", id)),
            audio_url: None,
            created_at,
        }
    }

    fn server_message(id: &str, created_at: i64) -> Message {
        message_in(&ConversationId::for_pair("alice", "bob"), id, created_at)
    }

    #[tokio::test]
    async fn live_arrival_before_history_yields_merged_order() {
        let (events_tx, _keep) = broadcast::channel(16);
        let (history_tx, history_rx) = oneshot::channel();
        let (mut view, _outbox_rx) = view_with_pending_history(&events_tx, history_rx);
        tokio::task::yield_now().await;

        // Live message 3 lands before the backlog resolves.
        events_tx
            .send(ServerEvent::MessageReceived(server_message("3", 300)))
            .unwrap();
        assert!(view.tick().await);
        assert!(view.messages().is_empty());

        history_tx
            .send(Ok(vec![server_message("1", 100), server_message("2", 200)]))
            .unwrap();
        assert!(view.tick().await);

        let ids: Vec<_> = view
            .messages()
            .iter()
            .map(|m| m.id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn failed_history_falls_back_to_live_only() {
        let (events_tx, _keep) = broadcast::channel(16);
        let (history_tx, history_rx) = oneshot::channel();
        let (mut view, _outbox_rx) = view_with_pending_history(&events_tx, history_rx);
        tokio::task::yield_now().await;

        history_tx
            .send(Err(ChatError::Fetch("boom".to_string())))
            .unwrap();
        assert!(view.tick().await);
        assert!(view.messages().is_empty());

        events_tx
            .send(ServerEvent::MessageReceived(server_message("9", 900)))
            .unwrap();
        assert!(view.tick().await);
        assert_eq!(view.messages().len(), 1);
    }

    #[tokio::test]
    async fn optimistic_send_appears_immediately() {
        let (events_tx, _keep) = broadcast::channel(16);
        let (history_tx, history_rx) = oneshot::channel();
        let (mut view, _outbox_rx) = view_with_pending_history(&events_tx, history_rx);

        history_tx.send(Ok(Vec::new())).unwrap();
        assert!(view.tick().await);

        let local = view.send_text("ciao").unwrap();
        assert_eq!(view.messages().len(), 1);
        assert!(view.messages()[0].id.is_none());
        assert_eq!(local.text.as_deref(), Some("ciao"));
    }

    #[tokio::test]
    async fn opening_second_conversation_revokes_first_view() {
        let config = ChatConfig {
            websocket_url: "ws://127.0.0.1:9".to_string(),
            api_base_url: "http://127.0.0.1:9".to_string(),
            upload_url: "http://127.0.0.1:9".to_string(),
            max_connect_attempts: 1,
            retry_delay_ms: 10,
            retry_delay_cap_ms: 40,
            connect_timeout_ms: 2_000,
        };
        let client = ChatClient::new(config);
        let _outbox = client.connection().test_established("alice", None);
        let events_tx = client.connection().test_events();

        let mut first = client.open_conversation("bob").unwrap();
        let mut second = client.open_conversation("carla").unwrap();
        tokio::task::yield_now().await;

        let bob_room = ConversationId::for_pair("alice", "bob");
        let carla_room = ConversationId::for_pair("alice", "carla");
        events_tx
            .send(ServerEvent::MessageReceived(message_in(&bob_room, "1", 100)))
            .unwrap();
        events_tx
            .send(ServerEvent::MessageReceived(message_in(&carla_room, "2", 200)))
            .unwrap();

        // The freshly opened view keeps delivering.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !second
            .messages()
            .iter()
            .any(|m| m.id.as_deref() == Some("2"))
        {
            assert!(tokio::time::Instant::now() < deadline, "live room never delivered");
            let _ =
                tokio::time::timeout(std::time::Duration::from_millis(500), second.tick()).await;
        }

        // The superseded view's feed ends; the room traffic sent after the
        // switch never reaches it.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "stale feed never ended");
            match tokio::time::timeout(std::time::Duration::from_secs(1), first.tick()).await {
                Ok(false) => break,
                _ => {}
            }
        }
        assert!(first
            .messages()
            .iter()
            .all(|m| m.id.as_deref() != Some("1")));
    }
}
