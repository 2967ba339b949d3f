//! Operational log: WARN+ events persisted to SQLite, keyed by the
//! question (`request_id`) and conversation (`session_key`) they belong to.
//!
//! Agent stderr, file-system errors and model failures land here and never
//! in a chat reply. `askrepo logs` reads it back.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS ops_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    logged_at TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}',
    request_id TEXT,
    session_key TEXT
);
CREATE INDEX IF NOT EXISTS ops_log_request ON ops_log(request_id, id);
CREATE INDEX IF NOT EXISTS ops_log_session ON ops_log(session_key, id);
CREATE INDEX IF NOT EXISTS ops_log_logged_at ON ops_log(logged_at);";

const COLUMNS: &str = "id, logged_at, level, target, message, fields, request_id, session_key";

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rewrite an RFC 3339 bound into the stored form so string comparison
/// orders correctly. Unparseable input is compared as given.
fn stored_timestamp(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| format_timestamp(at.with_timezone(&Utc)))
        .unwrap_or_else(|_| raw.to_string())
}

/// Default number of entries returned by [`OpsLog::search`].
pub const DEFAULT_SEARCH_LIMIT: u32 = 100;

/// One persisted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Structured event fields other than the message and correlation ids.
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl LogEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let fields: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            logged_at: row.get(1)?,
            level: row.get(2)?,
            target: row.get(3)?,
            message: row.get(4)?,
            fields: serde_json::from_str(&fields).unwrap_or_default(),
            request_id: row.get(6)?,
            session_key: row.get(7)?,
        })
    }

    /// `2026-10-19T12:00:00.000Z WARN askrepo_engine: agent failed request_id=req_1 exit_code=2`
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {:<5} {}: {}",
            self.logged_at, self.level, self.target, self.message
        );
        if let Some(request_id) = &self.request_id {
            line.push_str(&format!(" request_id={request_id}"));
        }
        if let Some(session_key) = &self.session_key {
            line.push_str(&format!(" session_key={session_key}"));
        }
        for (name, value) in &self.fields {
            match value {
                Value::String(s) => line.push_str(&format!(" {name}={s}")),
                other => line.push_str(&format!(" {name}={other}")),
            }
        }
        line
    }
}

/// Search filter. Unset fields match everything; results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub request_id: Option<String>,
    pub session_key: Option<String>,
    /// Exact level name, case-insensitive (`warn`, `ERROR`).
    pub level: Option<String>,
    /// RFC 3339 lower bound on `logged_at`.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogFilter {
    pub fn request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    pub fn session(session_key: impl Into<String>) -> Self {
        Self {
            session_key: Some(session_key.into()),
            ..Self::default()
        }
    }
}

/// SQLite-backed operational log.
pub struct OpsLog {
    conn: Mutex<Connection>,
}

impl OpsLog {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open only if the database already exists, so reading logs never
    /// creates an empty file.
    pub fn open_existing(db_path: &Path) -> Result<Option<Self>, rusqlite::Error> {
        if db_path.is_file() {
            Self::open(db_path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn append(&self, entry: &NewEntry) -> Result<i64, rusqlite::Error> {
        let fields = Value::Object(entry.fields.clone()).to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ops_log (logged_at, level, target, message, fields, request_id, session_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_timestamp(entry.logged_at),
                entry.level.to_string(),
                entry.target,
                entry.message,
                fields,
                entry.request_id,
                entry.session_key,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn search(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, rusqlite::Error> {
        let level = filter.level.as_deref().map(str::to_ascii_uppercase);
        let since = filter.since.as_deref().map(stored_timestamp);
        let limit = filter.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM ops_log
             WHERE (?1 IS NULL OR request_id = ?1)
               AND (?2 IS NULL OR session_key = ?2)
               AND (?3 IS NULL OR level = ?3)
               AND (?4 IS NULL OR logged_at >= ?4)
             ORDER BY id DESC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![filter.request_id, filter.session_key, level, since, limit],
            LogEntry::from_row,
        )?;
        rows.collect()
    }

    /// Everything logged for one question, oldest first.
    pub fn request_trail(&self, request_id: &str) -> Result<Vec<LogEntry>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM ops_log WHERE request_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([request_id], LogEntry::from_row)?;
        rows.collect()
    }

    pub fn len(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM ops_log", [], |row| row.get(0))
    }

    pub fn is_empty(&self) -> Result<bool, rusqlite::Error> {
        self.len().map(|n| n == 0)
    }
}

/// An event on its way into the log.
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub logged_at: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Map<String, Value>,
    pub request_id: Option<String>,
    pub session_key: Option<String>,
}

/// Collects an event's or span's fields as JSON values.
#[derive(Default)]
struct JsonFields(Map<String, Value>);

impl JsonFields {
    fn take_string(&mut self, name: &str) -> Option<String> {
        match self.0.remove(name)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }
}

impl Visit for JsonFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_str(field, &value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.into());
    }
}

/// Correlation ids remembered on a span, inherited by events inside it.
#[derive(Clone, Default)]
struct Correlation {
    request_id: Option<String>,
    session_key: Option<String>,
}

impl Correlation {
    fn take_from(fields: &mut JsonFields) -> Self {
        Self {
            request_id: fields.take_string("request_id"),
            session_key: fields.take_string("session_key"),
        }
    }

    fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.session_key.is_none()
    }

    fn fill_from(&mut self, outer: &Correlation) {
        if self.request_id.is_none() {
            self.request_id.clone_from(&outer.request_id);
        }
        if self.session_key.is_none() {
            self.session_key.clone_from(&outer.session_key);
        }
    }
}

/// tracing Layer writing WARN and ERROR events to an [`OpsLog`].
pub struct OpsLogLayer {
    log: Arc<OpsLog>,
}

impl OpsLogLayer {
    pub fn new(log: Arc<OpsLog>) -> Self {
        Self { log }
    }
}

impl<S> Layer<S> for OpsLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = JsonFields::default();
        attrs.record(&mut fields);
        let ids = Correlation::take_from(&mut fields);
        if ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(ids);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = JsonFields::default();
        event.record(&mut fields);
        let message = fields.take_string("message").unwrap_or_default();
        let mut ids = Correlation::take_from(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    ids.fill_from(outer);
                }
            }
        }

        // A failed write cannot be reported through tracing from inside the layer.
        let _ = self.log.append(&NewEntry {
            logged_at: Utc::now(),
            level,
            target: event.metadata().target().to_string(),
            message,
            fields: fields.0,
            request_id: ids.request_id,
            session_key: ids.session_key,
        });
    }
}
