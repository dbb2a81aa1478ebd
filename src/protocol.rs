use serde::{Serialize, Deserialize};

use crate::error::ChatError;
use crate::models::{Message, MessageKind};

/// Client -> server frames. Each serializes to a JSON object carrying an
/// `event` discriminator the server dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Auth { session_token: String },
    #[serde(rename_all = "camelCase")]
    JoinChat { target_user_id: String },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        target_user_id: String,
        message_type: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        correlation_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Server -> client frames pushed over the transport after auth.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    AuthResponse(AuthResponse),
    MessageReceived(Message),
    UpdateOnlineUsers(Vec<String>),
}

pub fn encode_client_event(event: &ClientEvent) -> Result<String, ChatError> {
    serde_json::to_string(event)
        .map_err(|e| ChatError::InvalidMessage(format!("Failed to serialize event: {}", e)))
}

/// Parse a server frame. Probes the `event` field first so an unknown event
/// name yields a useful error instead of a generic deserialization failure.
pub fn parse_server_event(text: &str) -> Result<ServerEvent, ChatError> {
    let generic: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ChatError::InvalidMessage(format!("Invalid JSON: {}", e)))?;

    let event = generic
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChatError::InvalidMessage("Missing event field".to_string()))?;

    match event {
        "authResponse" => {
            let resp: AuthResponse = serde_json::from_value(generic.clone())
                .map_err(|e| ChatError::InvalidMessage(format!("Bad authResponse: {}", e)))?;
            Ok(ServerEvent::AuthResponse(resp))
        }
        "messageReceived" => {
            let message = generic
                .get("message")
                .cloned()
                .ok_or_else(|| ChatError::InvalidMessage("messageReceived without message".to_string()))?;
            let message: Message = serde_json::from_value(message)
                .map_err(|e| ChatError::InvalidMessage(format!("Bad message payload: {}", e)))?;
            Ok(ServerEvent::MessageReceived(message))
        }
        "updateOnlineUsers" => {
            let ids = generic
                .get("userIds")
                .cloned()
                .ok_or_else(|| ChatError::InvalidMessage("updateOnlineUsers without userIds".to_string()))?;
            let ids: Vec<String> = serde_json::from_value(ids)
                .map_err(|e| ChatError::InvalidMessage(format!("Bad userIds payload: {}", e)))?;
            Ok(ServerEvent::UpdateOnlineUsers(ids))
        }
        other => Err(ChatError::InvalidMessage(format!("Unknown event type: {}", other))),
    }
}
