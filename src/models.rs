use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Audio,
}

/// Canonical id for a two-party conversation. Both ends derive the same id
/// regardless of who opened the chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn for_pair(a: &str, b: &str) -> Self {
        if a <= b {
            ConversationId(format!("{}:{}", a, b))
        } else {
            ConversationId(format!("{}:{}", b, a))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat message. Immutable once created; `id` is absent on optimistic local
/// entries until the server echo assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Client-generated id attached to optimistic sends so the server echo can
    /// be reconciled against the local entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Unix millis.
    pub created_at: i64,
}

impl Message {
    /// Optimistic local text message, shown before the server acknowledges it.
    pub fn local_text(sender_id: &str, target_id: &str, text: &str) -> Self {
        Self {
            id: None,
            correlation_id: Some(uuid::Uuid::new_v4().to_string()),
            conversation_id: ConversationId::for_pair(sender_id, target_id),
            sender_id: sender_id.to_string(),
            kind: MessageKind::Text,
            text: Some(text.to_string()),
            audio_url: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Optimistic local audio message referencing an already-uploaded clip.
    pub fn local_audio(sender_id: &str, target_id: &str, audio_url: &str) -> Self {
        Self {
            id: None,
            correlation_id: Some(uuid::Uuid::new_v4().to_string()),
            conversation_id: ConversationId::for_pair(sender_id, target_id),
            sender_id: sender_id.to_string(),
            kind: MessageKind::Audio,
            text: None,
            audio_url: Some(audio_url.to_string()),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Body used for id-less dedup tie-breaks.
    pub fn content_key(&self) -> &str {
        match self.kind {
            MessageKind::Text => self.text.as_deref().unwrap_or(""),
            MessageKind::Audio => self.audio_url.as_deref().unwrap_or(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_order_independent() {
        assert_eq!(
            ConversationId::for_pair("alice", "bob"),
            ConversationId::for_pair("bob", "alice")
        );
    }

    #[test]
    fn local_text_carries_correlation_id_but_no_server_id() {
        let msg = Message::local_text("alice", "bob", "ciao");
        assert!(msg.id.is_none());
        assert!(msg.correlation_id.is_some());
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.content_key(), "ciao");
    }
}
