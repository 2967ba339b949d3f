//! # askrepo-settings
//!
//! Startup configuration for askrepo, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`AskrepoSettings::default()`]
//! 2. **Settings file**: `~/.askrepo/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `ASKREPO_*` overrides (highest priority)
//!
//! Settings are read once and shared immutably for the life of the process.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = AskrepoSettings::default();
        assert_eq!(settings.conversation.window, 10);
        assert_eq!(settings.conversation.ttl_secs, 86_400);
        assert_eq!(settings.conversation.backend, SessionBackend::Memory);
        assert_eq!(settings.agent.command, "cursor-agent");
        assert_eq!(settings.agent.timeout_ms, 600_000);
        assert_eq!(settings.agent.max_concurrent, 2);
        assert!(settings.repository.readonly_enforcement);
        assert_eq!(settings.synthesis.model, "models/gemini-flash-latest");
        assert_eq!(settings.synthesis.retry.max_retries, 3);
        assert!(settings.validate().is_ok());
    }
}
