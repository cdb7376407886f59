use std::time::Duration;

/// Failures of the streaming connection. All of them end the turn.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("stream closed before a terminal event")]
    ClosedEarly,
    #[error("idle timeout after {0:?}")]
    IdleTimeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ConnectionError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Status { .. } => "status",
            Self::Interrupted(_) => "interrupted",
            Self::ClosedEarly => "closed_early",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400..=499 => Self::InvalidRequest(format!("status {status}: {body}")),
            _ => Self::Status { status, body },
        }
    }
}

/// Why a raw frame could not be turned into a [`crate::events::StreamEvent`].
/// Always recovered by dropping the frame.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no type discriminant")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Errors returned by the thread and agent collaborators.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CollabError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}
