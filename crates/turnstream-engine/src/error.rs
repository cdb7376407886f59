use turnstream_core::errors::CollabError;
use turnstream_core::ids::{AgentId, ThreadId};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("collaborator error: {0}")]
    Collab(#[from] CollabError),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),

    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("message is empty")]
    EmptyMessage,

    #[error("turn context must be cleared before a new turn begins")]
    ContextNotCleared,
}

impl SessionError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Collab(_) => "collab",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::ThreadNotFound(_) => "thread_not_found",
            Self::TurnInProgress => "turn_in_progress",
            Self::EmptyMessage => "empty_message",
            Self::ContextNotCleared => "context_not_cleared",
        }
    }
}
