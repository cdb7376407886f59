//! Interfaces to the services that own durable conversation storage and agent
//! metadata. Implementations live outside this core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CollabError;
use crate::ids::{AgentId, ThreadId};
use crate::messages::ConversationMessage;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: ThreadId,
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub status: AgentStatus,
}

/// Durable conversation storage.
#[async_trait]
pub trait ThreadService: Send + Sync {
    async fn get_thread(&self, id: &ThreadId) -> Result<Option<Thread>, CollabError>;
    async fn create_thread(&self, agent_id: &AgentId) -> Result<Thread, CollabError>;
    async fn delete_thread(&self, id: &ThreadId) -> Result<(), CollabError>;
}

/// Read-only agent metadata.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentInfo>, CollabError>;
}
