//! Tracing subscriber setup for turnstream processes.
//!
//! [`init_telemetry`] installs a global subscriber made of a reloadable
//! `EnvFilter`, a stdout formatter (JSON or plain) and an optional
//! [`CaptureLayer`] that keeps recent warn+ records in memory.

mod capture;

pub use capture::{CaptureLayer, LogCapture, LogQuery, LogRecord};

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use turnstream_settings::LoggingSettings;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("global subscriber already installed: {0}")]
    Init(String),
    #[error("failed to reload log filter: {0}")]
    Reload(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG` at startup.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "turnstream_client" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub json: bool,
    /// Ring buffer size for warn+ capture; 0 disables capture.
    pub capture_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            capture_capacity: 500,
        }
    }
}

impl TelemetryConfig {
    /// Unknown level names fall back to INFO.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            log_level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: settings.json,
            capture_capacity: settings.capture_capacity,
        }
    }
}

/// Handle to the installed subscriber. Keep it alive for the process lifetime.
pub struct TelemetryGuard {
    capture: Option<Arc<LogCapture>>,
    base_level: Level,
    module_levels: RwLock<Vec<(String, Level)>>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        let filter = EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::Filter(e.to_string()))?;
        self.reload
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Captured warn+ records, when capture is enabled.
    pub fn logs(&self) -> Option<&LogCapture> {
        self.capture.as_deref()
    }
}

/// Build an `EnvFilter` directive string such as `info,turnstream_client=debug`.
pub fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut out = base.to_string().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    out
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };
    let (filter_layer, reload) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let plain_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let capture = (config.capture_capacity > 0)
        .then(|| Arc::new(LogCapture::new(config.capture_capacity)));
    let capture_layer = capture.as_ref().map(|c| CaptureLayer::new(Arc::clone(c)));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(plain_layer)
        .with(capture_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    Ok(TelemetryGuard {
        capture,
        base_level: config.log_level,
        module_levels: RwLock::new(config.module_levels),
        reload,
    })
}
