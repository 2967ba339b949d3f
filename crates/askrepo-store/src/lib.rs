//! Bounded, expiring conversation history.
//!
//! Two backends implement [`SessionStore`]: an in-process map and a SQLite
//! file. Both keep at most `window` turns per session and forget sessions
//! after `ttl` of inactivity.

pub mod database;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use store::SessionStore;
