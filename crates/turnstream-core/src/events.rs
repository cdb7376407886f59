use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::ids::StepId;
use crate::trace::{TokenCounts, TraceMetadata, TraceStatus};

/// Decoded server event. Strict ordering contract, per turn:
///
/// (Token | TraceStart | TraceUpdate | TraceEnd)* → (Done | Error)
///
/// Every trace_update/trace_end is expected after the trace_start with the
/// same step id; violations are absorbed downstream, never reordered here.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token(TokenDelta),
    TraceStart(TraceStart),
    TraceUpdate(TraceUpdate),
    TraceEnd(TraceEnd),
    Done(Done),
    Error(StreamFailure),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TokenDelta {
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceStart {
    pub step_id: StepId,
    pub name: String,
    pub tool_type: String,
    pub input: Value,
    pub metadata: TraceMetadata,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceUpdate {
    pub step_id: StepId,
    pub status: TraceStatus,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceEnd {
    pub step_id: StepId,
    pub status: TraceStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
    pub tokens: TokenCounts,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Done {
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamFailure {
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self::Token(TokenDelta {
            content: content.into(),
            timestamp: None,
        })
    }

    pub fn done() -> Self {
        Self::Done(Done::default())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(StreamFailure {
            message: message.into(),
            timestamp: None,
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::TraceStart(_) => "trace_start",
            Self::TraceUpdate(_) => "trace_update",
            Self::TraceEnd(_) => "trace_end",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Token(e) => e.timestamp,
            Self::TraceStart(e) => e.timestamp,
            Self::TraceUpdate(e) => e.timestamp,
            Self::TraceEnd(e) => e.timestamp,
            Self::Done(e) => e.timestamp,
            Self::Error(e) => e.timestamp,
        }
    }

    /// Done and Error end the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }

    pub fn is_trace(&self) -> bool {
        matches!(
            self,
            Self::TraceStart(_) | Self::TraceUpdate(_) | Self::TraceEnd(_)
        )
    }

    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            Self::TraceStart(e) => Some(&e.step_id),
            Self::TraceUpdate(e) => Some(&e.step_id),
            Self::TraceEnd(e) => Some(&e.step_id),
            _ => None,
        }
    }
}

impl TraceStart {
    pub fn new(step_id: impl Into<StepId>, name: impl Into<String>, tool_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            tool_type: tool_type.into(),
            input: Value::Object(serde_json::Map::new()),
            metadata: TraceMetadata::default(),
            timestamp: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

impl TraceEnd {
    pub fn new(step_id: impl Into<StepId>, status: TraceStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output: None,
            error: None,
            latency_ms: None,
            tokens: TokenCounts::default(),
            timestamp: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}
