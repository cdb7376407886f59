//! Settings type definitions. camelCase JSON, every section `#[serde(default)]`
//! so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub transport: TransportSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

/// Streaming chat endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Base URL of the chat service, without trailing slash.
    pub base_url: String,
    /// Path of the streaming endpoint, appended to `base_url`.
    pub stream_path: String,
    pub connect_timeout_ms: u64,
    /// Maximum silence between two chunks before the stream is failed.
    pub idle_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            stream_path: "/api/chat/stream".to_string(),
            connect_timeout_ms: 30_000,
            idle_timeout_ms: 90_000,
        }
    }
}

/// What to do when a send arrives while a turn is still open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    Reject,
    #[default]
    CancelPrevious,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub busy_policy: BusyPolicy,
    /// Capacity of the live session event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::CancelPrevious,
            event_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Number of warn+ records kept in memory; 0 disables capture.
    pub capture_capacity: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            capture_capacity: 500,
        }
    }
}
