use askrepo_core::ids::SessionKey;
use askrepo_core::messages::{Role, Turn};

use crate::error::StoreError;

/// Storage for per-thread conversation windows.
///
/// Implementations keep each session to its configured window, oldest turns
/// evicted first, and treat sessions idle for longer than the TTL as absent.
/// Appends to the same key are atomic with respect to each other.
pub trait SessionStore: Send + Sync {
    /// Most recent turns, oldest first. Unknown and expired sessions are empty.
    fn get_context(&self, key: &SessionKey) -> Result<Vec<Turn>, StoreError>;

    /// Append one turn, creating the session (or a fresh window if it expired).
    fn append_turn(&self, key: &SessionKey, role: Role, content: &str) -> Result<(), StoreError>;

    /// Drop every expired session. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;

    /// Forget a session immediately. Returns whether it existed.
    fn evict(&self, key: &SessionKey) -> Result<bool, StoreError>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}
