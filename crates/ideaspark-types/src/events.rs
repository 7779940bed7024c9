use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events pushed to a connected client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is registered
    Ready { user_id: Uuid, username: String },

    /// A message was appended to one of the user's conversations
    MessageCreate { message: Message },

    /// The assistant started or stopped composing a reply
    Typing(TypingState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub conversation_id: Uuid,
    pub is_typing: bool,
    pub note: String,
}

impl TypingState {
    pub fn started(conversation_id: Uuid, note: impl Into<String>) -> Self {
        Self {
            conversation_id,
            is_typing: true,
            note: note.into(),
        }
    }

    pub fn stopped(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            is_typing: false,
            note: String::new(),
        }
    }
}
