//! Layered settings: compiled defaults, then the user's JSON file, then
//! `TURNSTREAM_*` environment variables.
//!
//! The file is overlaid with [`deep_merge`]: nested objects combine key by
//! key, any other value (arrays included) replaces the default, and a `null`
//! in the file leaves the default untouched.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{BusyPolicy, Settings};

/// `~/.turnstream/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".turnstream").join("settings.json")
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults; a file with invalid JSON is an error.
/// Environment overrides are applied in both cases.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut layered = serde_json::to_value(Settings::default())?;
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            debug!(path = %path.display(), "overlaying settings file");
            layered = deep_merge(layered, serde_json::from_str(&raw)?);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
        }
        Err(e) => return Err(e.into()),
    }

    let mut settings: Settings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Overlay `overlay` onto `base` and return the result.
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    overlay_into(&mut base, overlay);
    base
}

fn overlay_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => overlay_into(slot, value),
                    None if !value.is_null() => {
                        let _ = base_map.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply `TURNSTREAM_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value wins.
pub fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let ranged = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = string("TURNSTREAM_BASE_URL") {
        settings.transport.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = string("TURNSTREAM_STREAM_PATH") {
        settings.transport.stream_path = v;
    }
    if let Some(v) = ranged("TURNSTREAM_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.transport.connect_timeout_ms = v;
    }
    if let Some(v) = ranged("TURNSTREAM_IDLE_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.transport.idle_timeout_ms = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = string("TURNSTREAM_BUSY_POLICY") {
        match parse_busy_policy(&v) {
            Some(p) => settings.session.busy_policy = p,
            None => tracing::warn!(value = %v, "invalid TURNSTREAM_BUSY_POLICY, ignoring"),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("TURNSTREAM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = lookup("TURNSTREAM_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => tracing::warn!(value = %v, "invalid TURNSTREAM_LOG_JSON, ignoring"),
        }
    }
}

pub fn parse_bool(val: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["true", "1", "yes", "on"];
    const FALSE: [&str; 4] = ["false", "0", "no", "off"];
    let val = val.trim().to_ascii_lowercase();
    if TRUE.contains(&val.as_str()) {
        Some(true)
    } else if FALSE.contains(&val.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Integer within `min..=max`, else `None`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim().parse::<u64>().ok().filter(|n| (min..=max).contains(n))
}

pub fn parse_busy_policy(val: &str) -> Option<BusyPolicy> {
    match val.to_lowercase().replace('-', "_").as_str() {
        "reject" => Some(BusyPolicy::Reject),
        "cancel_previous" | "cancel" => Some(BusyPolicy::CancelPrevious),
        _ => None,
    }
}
