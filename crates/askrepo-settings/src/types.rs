//! Settings type definitions.
//!
//! All types use camelCase JSON keys and `#[serde(default)]`, so a settings
//! file only needs the fields it overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AskrepoSettings {
    pub conversation: ConversationSettings,
    pub repository: RepositorySettings,
    pub agent: AgentSettings,
    pub synthesis: SynthesisSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl AskrepoSettings {
    /// Reject values the rest of the system cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.conversation.window == 0 {
            return Err(SettingsError::InvalidValue(
                "conversation.window must be at least 1".into(),
            ));
        }
        if self.conversation.ttl_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "conversation.ttlSecs must be positive".into(),
            ));
        }
        if self.agent.max_concurrent == 0 {
            return Err(SettingsError::InvalidValue(
                "agent.maxConcurrent must be at least 1".into(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(SettingsError::InvalidValue("agent.command is empty".into()));
        }
        if self.agent.timeout_ms == 0 || self.synthesis.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "timeouts must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.synthesis.retry.jitter_factor) {
            return Err(SettingsError::InvalidValue(
                "synthesis.retry.jitterFactor must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Which backend holds conversation history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for SessionBackend {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown session backend: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationSettings {
    /// Maximum turns kept per session.
    pub window: usize,
    /// Inactivity after which a session is forgotten.
    pub ttl_secs: u64,
    pub backend: SessionBackend,
    /// In-memory backend only: least-recently-active sessions are evicted past this.
    pub max_sessions: usize,
    pub sweep_interval_secs: u64,
    pub db_path: String,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            window: 10,
            ttl_secs: 86_400,
            backend: SessionBackend::Memory,
            max_sessions: 10_000,
            sweep_interval_secs: 300,
            db_path: askrepo_home().join("sessions.db").display().to_string(),
        }
    }
}

impl ConversationSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositorySettings {
    /// Root of the repository the agent analyzes.
    pub path: String,
    /// Make the tree read-only while an agent runs.
    pub readonly_enforcement: bool,
    /// Upper bound on waiting for the per-path transition lock.
    pub lock_timeout_ms: u64,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            path: "./repo".into(),
            readonly_enforcement: true,
            lock_timeout_ms: 30_000,
        }
    }
}

impl RepositorySettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Executable of the external analysis agent.
    pub command: String,
    /// Arguments placed before `--workspace <path>` and the query.
    pub args: Vec<String>,
    pub timeout_ms: u64,
    /// Simultaneously running agent processes.
    pub max_concurrent: usize,
    /// Requests allowed to wait for a free slot before `Busy` is returned.
    pub queue_capacity: usize,
    /// Pass `--` before the query so it can never be read as an option.
    pub end_of_options: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "cursor-agent".into(),
            args: vec![
                "--print".into(),
                "--output-format".into(),
                "json".into(),
            ],
            timeout_ms: 600_000,
            max_concurrent: 2,
            queue_capacity: 8,
            end_of_options: true,
        }
    }
}

impl AgentSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesisSettings {
    /// OpenAI-compatible API root (`/chat/completions` is appended).
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Overall budget for one synthesis, retries included.
    pub timeout_ms: u64,
    /// Budget for a single HTTP attempt.
    pub request_timeout_ms: u64,
    pub max_tokens: Option<u32>,
    pub retry: RetrySettings,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".into(),
            model: "models/gemini-flash-latest".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            timeout_ms: 60_000,
            request_timeout_ms: 30_000,
            max_tokens: None,
            retry: RetrySettings::default(),
        }
    }
}

impl SynthesisSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Chat user id of the bot itself; mentions of it are stripped from questions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_user_id: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            bot_user_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Persist WARN+ events to the operational log database.
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_to_sqlite: true,
            log_db_path: askrepo_home().join("logs.db").display().to_string(),
        }
    }
}

/// `~/.askrepo`, falling back to `/tmp/.askrepo` without a home directory.
pub fn askrepo_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".askrepo")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(AskrepoSettings::default()).unwrap();
        assert!(json["conversation"].get("ttlSecs").is_some());
        assert!(json["repository"].get("readonlyEnforcement").is_some());
        assert!(json["agent"].get("maxConcurrent").is_some());
        assert!(json["server"].get("botUserId").is_none());
    }

    #[test]
    fn partial_section_gets_defaults() {
        let parsed: AgentSettings = serde_json::from_str(r#"{"maxConcurrent": 4}"#).unwrap();
        assert_eq!(parsed.max_concurrent, 4);
        assert_eq!(parsed.command, "cursor-agent");
        assert_eq!(parsed.timeout(), Duration::from_secs(600));
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("SQLite".parse::<SessionBackend>().unwrap(), SessionBackend::Sqlite);
        assert!("redis".parse::<SessionBackend>().is_err());
        let parsed: ConversationSettings =
            serde_json::from_str(r#"{"backend": "sqlite"}"#).unwrap();
        assert_eq!(parsed.backend, SessionBackend::Sqlite);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut settings = AskrepoSettings::default();
        settings.conversation.window = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_pool() {
        let mut settings = AskrepoSettings::default();
        settings.agent.max_concurrent = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_jitter() {
        let mut settings = AskrepoSettings::default();
        settings.synthesis.retry.jitter_factor = 1.5;
        assert!(settings.validate().is_err());
    }
}
