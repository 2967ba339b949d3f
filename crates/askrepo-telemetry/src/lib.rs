mod logging;

pub use logging::{LogEntry, LogFilter, NewEntry, OpsLog, OpsLogLayer, DEFAULT_SEARCH_LIMIT};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "askrepo_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: dirs_fallback().join("logs.db"),
        }
    }
}

/// Handle returned by [`init_telemetry`]; keeps the operational log reachable.
pub struct TelemetryGuard {
    ops_log: Option<Arc<OpsLog>>,
}

impl TelemetryGuard {
    /// The operational log, when persistence is enabled and the database opened.
    pub fn ops_log(&self) -> Option<&OpsLog> {
        self.ops_log.as_deref()
    }
}

/// Parse a level name from settings, falling back to INFO.
pub fn parse_level(name: &str) -> Level {
    name.parse().unwrap_or(Level::INFO)
}

fn filter_directive(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&config)));

    // JSON to stderr; stdout is reserved for `ask` answers
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (ops_layer, ops_log) = if config.log_to_sqlite {
        match OpsLog::open(&config.log_db_path) {
            Ok(log) => {
                let log = Arc::new(log);
                (Some(OpsLogLayer::new(Arc::clone(&log))), Some(log))
            }
            Err(e) => {
                eprintln!("askrepo-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(ops_layer)
        .init();

    TelemetryGuard { ops_log }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".askrepo")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("askrepo_engine".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(filter_directive(&config), "warn,askrepo_engine=debug");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }
}
