//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`AskrepoSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{askrepo_home, AskrepoSettings, SessionBackend};

/// Resolve the default settings file path (`~/.askrepo/settings.json`).
pub fn settings_path() -> PathBuf {
    askrepo_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<AskrepoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or invalid values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<AskrepoSettings> {
    let defaults = serde_json::to_value(AskrepoSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AskrepoSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut AskrepoSettings) {
    // ── Conversation ────────────────────────────────────────────────
    if let Some(v) = read_env_usize("ASKREPO_WINDOW", 1, 1_000) {
        settings.conversation.window = v;
    }
    if let Some(v) = read_env_u64("ASKREPO_SESSION_TTL_SECS", 1, 31_536_000) {
        settings.conversation.ttl_secs = v;
    }
    if let Some(v) = read_env_string("ASKREPO_SESSION_BACKEND") {
        match v.parse::<SessionBackend>() {
            Ok(backend) => settings.conversation.backend = backend,
            Err(e) => tracing::warn!(key = "ASKREPO_SESSION_BACKEND", error = %e, "ignoring"),
        }
    }
    if let Some(v) = read_env_string("ASKREPO_SESSION_DB") {
        settings.conversation.db_path = v;
    }

    // ── Repository ──────────────────────────────────────────────────
    if let Some(v) = read_env_string("ASKREPO_REPOSITORY_PATH") {
        settings.repository.path = v;
    }
    if let Some(v) = read_env_bool("ASKREPO_READONLY_ENFORCEMENT") {
        settings.repository.readonly_enforcement = v;
    }

    // ── Agent ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("ASKREPO_AGENT_COMMAND") {
        settings.agent.command = v;
    }
    if let Some(v) = read_env_u64("ASKREPO_AGENT_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.agent.timeout_ms = v;
    }
    if let Some(v) = read_env_usize("ASKREPO_AGENT_MAX_CONCURRENT", 1, 64) {
        settings.agent.max_concurrent = v;
    }

    // ── Synthesis ───────────────────────────────────────────────────
    if let Some(v) = read_env_string("ASKREPO_LLM_BASE_URL") {
        settings.synthesis.base_url = v;
    }
    if let Some(v) = read_env_string("ASKREPO_LLM_MODEL") {
        settings.synthesis.model = v;
    }
    if let Some(v) = read_env_u64("ASKREPO_SYNTHESIS_TIMEOUT_MS", 1_000, 600_000) {
        settings.synthesis.timeout_ms = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("ASKREPO_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("ASKREPO_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("ASKREPO_BOT_USER_ID") {
        settings.server.bot_user_id = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "agent": {"timeoutMs": 600000, "command": "cursor-agent"}
        });
        let source = serde_json::json!({
            "agent": {"timeoutMs": 1000}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["agent"]["timeoutMs"], 1000);
        assert_eq!(merged["agent"]["command"], "cursor-agent");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"args": ["--print", "--output-format", "json"]});
        let source = serde_json::json!({"args": ["--json"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["args"], serde_json::json!(["--json"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/askrepo/settings.json");
        let settings = load_settings_from_path(path).unwrap();
        assert_eq!(settings.conversation.ttl_secs, 86_400);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"agent": {"queueCapacity": 3}, "synthesis": {"retry": {"maxRetries": 5}}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.agent.queue_capacity, 3);
        assert_eq!(settings.synthesis.retry.max_retries, 5);
        assert_eq!(settings.synthesis.retry.base_delay_ms, 1000);
        assert_eq!(settings.agent.command, "cursor-agent");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"conversation": {"window": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::InvalidValue(_)));
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 1_000, 10_000), None);
        assert_eq!(parse_usize_range("4", 1, 64), Some(4));
        assert_eq!(parse_usize_range("abc", 1, 64), None);
    }
}
