use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One entry of the local conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Display name of the agent that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), Utc::now())
    }

    /// Empty assistant message that is about to receive tokens.
    pub fn assistant_streaming(now: DateTime<Utc>) -> Self {
        let mut msg = Self::new(Role::Assistant, String::new(), now);
        msg.streaming = true;
        msg
    }

    pub fn new(role: Role, content: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            timestamp,
            streaming: false,
            error: None,
            author: None,
            cancelled: false,
        }
    }

    /// Whether this message belongs in the history sent back to the server.
    /// Failed and cancelled replies are kept for display only.
    pub fn is_replayable(&self) -> bool {
        !self.streaming && self.error.is_none() && !self.cancelled
    }
}

/// History entry as sent in the streaming request payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ConversationMessage> for WireMessage {
    fn from(m: &ConversationMessage) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}
