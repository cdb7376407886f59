//! Raw frame → [`StreamEvent`] mapping.
//!
//! Pure and order-preserving: one frame in, at most one event out. Frames that
//! cannot be decoded are dropped by [`decode`]; [`decode_frame`] reports why.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use turnstream_core::errors::DecodeError;
use turnstream_core::events::{
    Done, StreamEvent, StreamFailure, TokenDelta, TraceEnd, TraceStart, TraceUpdate,
};
use turnstream_core::ids::StepId;
use turnstream_core::trace::{TokenCounts, TraceMetadata, TraceStatus};

use crate::transport::RawFrame;

#[derive(Deserialize)]
struct WireToken {
    content: String,
}

#[derive(Deserialize)]
struct WireTraceStart {
    #[serde(alias = "stepId")]
    step_id: String,
    #[serde(alias = "name")]
    tool_name: String,
    #[serde(default)]
    tool_type: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    mcp_server: Option<String>,
    #[serde(default)]
    openapi_endpoint: Option<String>,
    #[serde(default)]
    a2a_agent: Option<String>,
}

#[derive(Deserialize)]
struct WireTraceUpdate {
    #[serde(alias = "stepId")]
    step_id: String,
    status: TraceStatus,
}

#[derive(Deserialize)]
struct WireTraceEnd {
    #[serde(alias = "stepId")]
    step_id: String,
    status: TraceStatus,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    latency_ms: Option<f64>,
    #[serde(default)]
    tokens_input: Option<u64>,
    #[serde(default)]
    tokens_output: Option<u64>,
    #[serde(default)]
    tokens_total: Option<u64>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

/// Decode one frame, dropping it (with a debug log) when it is not a valid event.
pub fn decode(frame: &RawFrame) -> Option<StreamEvent> {
    match decode_frame(frame) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, sse_event = ?frame.event, "dropping undecodable frame");
            None
        }
    }
}

/// Decode one frame, reporting why it was rejected.
pub fn decode_frame(frame: &RawFrame) -> Result<StreamEvent, DecodeError> {
    let mut value: Value = if frame.data.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&frame.data).map_err(|e| DecodeError::InvalidJson(e.to_string()))?
    };

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => frame.event.clone().ok_or(DecodeError::MissingType)?,
    };
    let timestamp = value.get("timestamp").and_then(parse_timestamp);
    if let Value::Object(map) = &mut value {
        let _ = map.remove("type");
        let _ = map.remove("timestamp");
    }

    let event = match kind.as_str() {
        "token" => {
            let w: WireToken = fields(&kind, value)?;
            StreamEvent::Token(TokenDelta {
                content: w.content,
                timestamp,
            })
        }
        "trace_start" => {
            let w: WireTraceStart = fields(&kind, value)?;
            StreamEvent::TraceStart(TraceStart {
                step_id: StepId::from_raw(w.step_id),
                name: w.tool_name,
                tool_type: w.tool_type,
                input: match w.input {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(v) => v,
                },
                metadata: TraceMetadata {
                    mcp_server: w.mcp_server,
                    openapi_endpoint: w.openapi_endpoint,
                    a2a_agent: w.a2a_agent,
                },
                timestamp,
            })
        }
        "trace_update" => {
            let w: WireTraceUpdate = fields(&kind, value)?;
            StreamEvent::TraceUpdate(TraceUpdate {
                step_id: StepId::from_raw(w.step_id),
                status: w.status,
                timestamp,
            })
        }
        "trace_end" => {
            let w: WireTraceEnd = fields(&kind, value)?;
            if !w.status.is_terminal() {
                return Err(DecodeError::Malformed {
                    kind: kind.clone(),
                    reason: format!("non-terminal status {}", w.status),
                });
            }
            StreamEvent::TraceEnd(TraceEnd {
                step_id: StepId::from_raw(w.step_id),
                status: w.status,
                output: w.output,
                error: w.error,
                latency_ms: w.latency_ms.map(|l| l.max(0.0).round() as u64),
                tokens: TokenCounts {
                    input: w.tokens_input,
                    output: w.tokens_output,
                    total: w.tokens_total,
                },
                timestamp,
            })
        }
        "done" => StreamEvent::Done(Done { timestamp }),
        "error" => {
            let w: WireError = fields(&kind, value)?;
            StreamEvent::Error(StreamFailure {
                message: w.message,
                timestamp,
            })
        }
        _ => return Err(DecodeError::UnknownType(kind.clone())),
    };
    Ok(event)
}

fn fields<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// RFC 3339, naive ISO-8601 (taken as UTC), or epoch seconds / milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => {
            let raw = n.as_f64()?;
            if raw.abs() >= 1e11 {
                DateTime::from_timestamp_millis(raw as i64)
            } else {
                let secs = raw.trunc() as i64;
                let nanos = (raw.fract().abs() * 1e9) as u32;
                DateTime::from_timestamp(secs, nanos)
            }
        }
        _ => None,
    }
}
