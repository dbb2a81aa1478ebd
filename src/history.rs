use log::info;

use crate::error::ChatError;
use crate::models::{ConversationId, Message};

/// One-shot fetch of the persisted backlog for a conversation. Independent of
/// the live channel; the caller must not assume it completes before the first
/// live message arrives.
#[derive(Clone)]
pub struct HistoryLoader {
    http: reqwest::Client,
    api_base_url: String,
}

impl HistoryLoader {
    pub fn new(api_base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the backlog, ordered non-decreasing by `created_at`. No internal
    /// retry; failures surface as `ChatError::Fetch` and the view falls back
    /// to live-only.
    pub async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.api_base_url, conversation_id
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChatError::Fetch(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChatError::Fetch(format!(
                "server returned {}",
                response.status()
            )));
        }

        let mut messages: Vec<Message> = response
            .json()
            .await
            .map_err(|e| ChatError::Fetch(format!("bad backlog payload: {}", e)))?;

        // The server already orders the backlog; a stable sort keeps arrival
        // order among equal timestamps if it does not.
        messages.sort_by_key(|m| m.created_at);
        info!(
            "[HISTORY] Loaded {} messages for {}",
            messages.len(),
            conversation_id
        );
        Ok(messages)
    }
}
