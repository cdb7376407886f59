//! # turnstream-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`Settings::default()`]
//! 2. **User file**: `~/.turnstream/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TURNSTREAM_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = turnstream_settings::load_settings().unwrap_or_default();
//! println!("streaming from {}", settings.transport.base_url);
//! ```

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
