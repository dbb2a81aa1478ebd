use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;
use crate::error::ChatError;
use crate::models::{ConversationId, Message};
use crate::protocol::{ClientEvent, ServerEvent};

/// Live message feed for one joined room. Dropping it (or joining another
/// room) revokes the subscription; late events are discarded.
pub struct RoomSubscription {
    pub conversation_id: ConversationId,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl RoomSubscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

struct ActiveRoom {
    target_user_id: String,
    conversation_id: ConversationId,
    generation: u64,
    task: tokio::task::JoinHandle<()>,
}

/// Per-conversation send/receive surface. At most one room is live at a time;
/// joining a room mutes the previous subscription before the new one attaches,
/// so no handler ever sees another room's traffic after a switch.
pub struct ConversationChannel {
    handle: ConnectionHandle,
    self_id: String,
    /// Bumped on every join/leave. A filter task only forwards while its own
    /// generation is still the current one, which closes the re-join race:
    /// the bump happens before the new task exists.
    generation: Arc<AtomicU64>,
    active: Option<ActiveRoom>,
}

impl ConversationChannel {
    pub fn new(handle: ConnectionHandle, self_id: String) -> Self {
        Self::with_generation(handle, self_id, Arc::new(AtomicU64::new(0)))
    }

    /// Build a channel sharing a generation counter with other channels. Joins
    /// through any sharer mute every subscription vended by the others, which
    /// keeps "at most one live room" true across the whole client, not just
    /// per channel instance.
    pub fn with_generation(
        handle: ConnectionHandle,
        self_id: String,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            handle,
            self_id,
            generation,
            active: None,
        }
    }

    pub fn current_target(&self) -> Option<&str> {
        self.active.as_ref().map(|room| room.target_user_id.as_str())
    }

    /// Register interest in the room shared with `target_user_id`. Any
    /// previous subscription (including one for the same target) is fully
    /// revoked first.
    pub fn join(&mut self, target_user_id: &str) -> Result<RoomSubscription, ChatError> {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.active.take() {
            previous.task.abort();
            debug!("[CHAT] Left room {}", previous.conversation_id);
        }

        self.handle.send(ClientEvent::JoinChat {
            target_user_id: target_user_id.to_string(),
        })?;

        let conversation_id = ConversationId::for_pair(&self.self_id, target_user_id);
        info!("[CHAT] Joined room {}", conversation_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.handle.subscribe_events();
        let generation = self.generation.clone();
        let room_id = conversation_id.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    // Skipped events are missed messages, not a dead room;
                    // history reload covers gaps, so keep the feed alive.
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "[CHAT] Room {} feed lagged, {} events skipped",
                            room_id, skipped
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if generation.load(Ordering::SeqCst) != my_gen {
                    break;
                }
                if let ServerEvent::MessageReceived(message) = event {
                    if message.conversation_id != room_id {
                        continue;
                    }
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            }
        });

        self.active = Some(ActiveRoom {
            target_user_id: target_user_id.to_string(),
            conversation_id: conversation_id.clone(),
            generation: my_gen,
            task,
        });

        Ok(RoomSubscription {
            conversation_id,
            receiver: rx,
        })
    }

    /// Detach from the current room. Idempotent. The generation only advances
    /// when this channel's room is still the live one, so a stale sharer
    /// leaving (or being dropped) cannot mute a room joined after it.
    pub fn leave(&mut self) {
        if let Some(previous) = self.active.take() {
            let _ = self.generation.compare_exchange(
                previous.generation,
                previous.generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            previous.task.abort();
            info!("[CHAT] Left room {}", previous.conversation_id);
        }
    }

    /// Fire-and-forget text send to the joined room. Returns the optimistic
    /// local message for the view; the server echo reconciles against it via
    /// correlation id. Rejected synchronously when disconnected.
    pub fn send_text(&self, text: &str) -> Result<Message, ChatError> {
        let room = self
            .active
            .as_ref()
            .ok_or_else(|| ChatError::InvalidState("no room joined".to_string()))?;
        let message = Message::local_text(&self.self_id, &room.target_user_id, text);
        self.dispatch(&room.target_user_id, &message)?;
        Ok(message)
    }

    /// Same as `send_text` for an already-uploaded voice clip.
    pub fn send_audio(&self, audio_url: &str) -> Result<Message, ChatError> {
        let room = self
            .active
            .as_ref()
            .ok_or_else(|| ChatError::InvalidState("no room joined".to_string()))?;
        let message = Message::local_audio(&self.self_id, &room.target_user_id, audio_url);
        self.dispatch(&room.target_user_id, &message)?;
        Ok(message)
    }

    fn dispatch(&self, target_user_id: &str, message: &Message) -> Result<(), ChatError> {
        let correlation_id = message
            .correlation_id
            .clone()
            .unwrap_or_default();
        self.handle.send(ClientEvent::SendMessage {
            target_user_id: target_user_id.to_string(),
            message_type: message.kind,
            text: message.text.clone(),
            audio_url: message.audio_url.clone(),
            correlation_id,
        })
    }
}

impl Drop for ConversationChannel {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::models::MessageKind;
    use tokio::sync::broadcast;

    fn wire() -> (
        broadcast::Sender<ServerEvent>,
        mpsc::UnboundedReceiver<ClientEvent>,
        ConnectionHandle,
    ) {
        let (events_tx, _keep) = broadcast::channel(64);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::for_tests(
            events_tx.clone(),
            outbox_tx,
            ConnectionState::Connected,
        );
        (events_tx, outbox_rx, handle)
    }

    fn server_message(conversation_id: &ConversationId, id: &str, text: &str) -> Message {
        Message {
            id: Some(id.to_string()),
            correlation_id: None,
            conversation_id: conversation_id.clone(),
            sender_id: "bob".to_string(),
            kind: MessageKind::Text,
            text: Some(text.to_string()),
            audio_url: None,
            created_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn join_emits_join_chat_and_delivers_room_messages() {
        let (events_tx, mut outbox_rx, handle) = wire();
        let mut channel = ConversationChannel::new(handle, "alice".to_string());
        let mut sub = channel.join("bob").unwrap();

        match outbox_rx.recv().await.unwrap() {
            ClientEvent::JoinChat { target_user_id } => assert_eq!(target_user_id, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::task::yield_now().await;
        let room = ConversationId::for_pair("alice", "bob");
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room, "1", "ciao")))
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn messages_for_old_room_never_reach_new_subscription() {
        let (events_tx, _outbox_rx, handle) = wire();
        let mut channel = ConversationChannel::new(handle, "alice".to_string());
        let _sub_a = channel.join("bob").unwrap();
        let mut sub_b = channel.join("carla").unwrap();
        tokio::task::yield_now().await;

        let room_a = ConversationId::for_pair("alice", "bob");
        let room_b = ConversationId::for_pair("alice", "carla");
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room_a, "1", "stale")))
            .unwrap();
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room_b, "2", "fresh")))
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), sub_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id.as_deref(), Some("2"));
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn rejoining_same_target_revokes_previous_subscription() {
        let (events_tx, _outbox_rx, handle) = wire();
        let mut channel = ConversationChannel::new(handle, "alice".to_string());
        let mut first = channel.join("bob").unwrap();
        let mut second = channel.join("bob").unwrap();
        tokio::task::yield_now().await;

        let room = ConversationId::for_pair("alice", "bob");
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room, "1", "ciao")))
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), second.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id.as_deref(), Some("1"));
        // The first subscription is mute; no duplicate delivery.
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn send_without_room_is_invalid_state() {
        let (_events_tx, _outbox_rx, handle) = wire();
        let channel = ConversationChannel::new(handle, "alice".to_string());
        assert!(matches!(
            channel.send_text("ciao"),
            Err(ChatError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn send_text_queues_wire_event_with_correlation_id() {
        let (_events_tx, mut outbox_rx, handle) = wire();
        let mut channel = ConversationChannel::new(handle, "alice".to_string());
        channel.join("bob").unwrap();
        let _join = outbox_rx.recv().await.unwrap();

        let local = channel.send_text("ciao").unwrap();
        match outbox_rx.recv().await.unwrap() {
            ClientEvent::SendMessage {
                target_user_id,
                message_type,
                text,
                correlation_id,
                ..
            } => {
                assert_eq!(target_user_id, "bob");
                assert_eq!(message_type, MessageKind::Text);
                assert_eq!(text.as_deref(), Some("ciao"));
                assert_eq!(Some(correlation_id), local.correlation_id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn lagged_feed_keeps_delivering_later_messages() {
        // Capacity 1 so a burst overruns the filter task; its next recv sees
        // a lag report instead of an event.
        let (events_tx, _keep) = broadcast::channel(1);
        let (outbox_tx, _outbox_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::for_tests(
            events_tx.clone(),
            outbox_tx,
            ConnectionState::Connected,
        );

        let mut channel = ConversationChannel::new(handle, "alice".to_string());
        let mut sub = channel.join("bob").unwrap();
        tokio::task::yield_now().await;

        let room = ConversationId::for_pair("alice", "bob");
        // The second push evicts the first before the task reads it.
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room, "1", "lost")))
            .unwrap();
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room, "2", "kept")))
            .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id.as_deref(), Some("2"));

        // The subscription must survive the lag, not go permanently silent.
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room, "3", "later")))
            .unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn dropping_stale_sharer_leaves_newer_room_live() {
        let (events_tx, _outbox_rx, handle) = wire();
        let generation = Arc::new(AtomicU64::new(0));
        let mut stale =
            ConversationChannel::with_generation(handle.clone(), "alice".to_string(), generation.clone());
        let _old_sub = stale.join("bob").unwrap();

        let mut current =
            ConversationChannel::with_generation(handle, "alice".to_string(), generation);
        let mut sub = current.join("carla").unwrap();

        // The superseded channel going away must not mute the live room.
        drop(stale);
        tokio::task::yield_now().await;

        let room = ConversationId::for_pair("alice", "carla");
        events_tx
            .send(ServerEvent::MessageReceived(server_message(&room, "1", "ciao")))
            .unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id.as_deref(), Some("1"));
    }
}
