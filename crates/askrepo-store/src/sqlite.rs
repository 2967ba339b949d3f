use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use askrepo_core::ids::SessionKey;
use askrepo_core::messages::{Role, Turn};

use crate::database::Database;
use crate::error::StoreError;
use crate::store::SessionStore;

/// Session store backed by a SQLite file, surviving restarts.
///
/// Every append runs in one transaction: upsert the session row, insert the
/// turn, then delete everything older than the newest `window` turns.
pub struct SqliteSessionStore {
    db: Database,
    window: usize,
    ttl_ms: i64,
}

impl SqliteSessionStore {
    pub fn new(db: Database, window: usize, ttl: Duration) -> Self {
        Self {
            db,
            window: window.max(1),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn open(path: &Path, window: usize, ttl: Duration) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?, window, ttl))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn row_to_turn(role: String, content: String, timestamp: String) -> Result<Turn, StoreError> {
    let role: Role = role.parse().map_err(StoreError::Corrupt)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StoreError::Corrupt(format!("turn timestamp: {e}")))?
        .with_timezone(&Utc);
    Ok(Turn {
        role,
        content,
        timestamp,
    })
}

impl SessionStore for SqliteSessionStore {
    fn get_context(&self, key: &SessionKey) -> Result<Vec<Turn>, StoreError> {
        let session_key = key.to_string();
        self.db.with_conn(|conn| {
            let now = now_ms();
            let expires: Option<i64> = conn
                .query_row(
                    "SELECT expires_at_ms FROM sessions WHERE key = ?1",
                    [&session_key],
                    |row| row.get(0),
                )
                .optional()?;

            match expires {
                None => return Ok(Vec::new()),
                Some(at) if at <= now => {
                    conn.execute(
                        "DELETE FROM sessions WHERE key = ?1 AND expires_at_ms <= ?2",
                        params![session_key, now],
                    )?;
                    return Ok(Vec::new());
                }
                Some(_) => {}
            }

            let mut stmt = conn.prepare(
                "SELECT role, content, timestamp FROM turns
                 WHERE session_key = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![session_key, self.window as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<(String, String, String)>, _>>()?;

            let mut turns = rows
                .into_iter()
                .map(|(role, content, ts)| row_to_turn(role, content, ts))
                .collect::<Result<Vec<_>, _>>()?;
            turns.reverse();
            Ok(turns)
        })
    }

    #[instrument(skip(self, content), fields(session_key = %key))]
    fn append_turn(&self, key: &SessionKey, role: Role, content: &str) -> Result<(), StoreError> {
        let session_key = key.to_string();
        self.db.with_conn(|conn| {
            let now = now_ms();
            let tx = conn.transaction()?;

            let expires: Option<i64> = tx
                .query_row(
                    "SELECT expires_at_ms FROM sessions WHERE key = ?1",
                    [&session_key],
                    |row| row.get(0),
                )
                .optional()?;
            if matches!(expires, Some(at) if at <= now) {
                tx.execute("DELETE FROM turns WHERE session_key = ?1", [&session_key])?;
            }

            tx.execute(
                "INSERT INTO sessions
                     (key, actor_id, channel_id, thread_id, created_at, last_activity_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                     last_activity_ms = excluded.last_activity_ms,
                     expires_at_ms = excluded.expires_at_ms",
                params![
                    session_key,
                    key.actor_id,
                    key.channel_id,
                    key.thread_id,
                    Utc::now().to_rfc3339(),
                    now,
                    now.saturating_add(self.ttl_ms),
                ],
            )?;

            tx.execute(
                "INSERT INTO turns (session_key, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![session_key, role.as_str(), content, Utc::now().to_rfc3339()],
            )?;

            tx.execute(
                "DELETE FROM turns WHERE session_key = ?1 AND id NOT IN (
                     SELECT id FROM turns WHERE session_key = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![session_key, self.window as i64],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM sessions WHERE expires_at_ms <= ?1",
                [now_ms()],
            )?;
            Ok(removed)
        })
    }

    fn evict(&self, key: &SessionKey) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM sessions WHERE key = ?1", [key.to_string()])?;
            Ok(removed > 0)
        })
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}
