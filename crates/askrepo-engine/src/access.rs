//! Reference-counted write protection for the analyzed repository.
//!
//! The first holder of a path makes the tree read-only and the last one to
//! leave restores the exact permission bits it found. Transitions for one
//! path are serialized by a per-path mutex; holders arriving while the tree
//! is already read-only only bump the count.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

const WRITE_BITS: u32 = 0o222;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryLockError {
    #[error("timed out after {0:?} waiting for the repository transition lock")]
    LockTimeout(Duration),

    #[error("repository path unavailable: {0}")]
    Path(String),

    #[error("making {path} read-only failed: {reason}")]
    Transition { path: String, reason: String },

    #[error("restoring permissions on {path} failed: {reason}")]
    Restore { path: String, reason: String },

    #[error("guard task failed: {0}")]
    Join(String),
}

/// Original modes of every entry whose write bits were cleared.
#[derive(Debug, Default)]
pub struct PermissionSnapshot {
    entries: Vec<(PathBuf, u32)>,
}

impl PermissionSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Applies and reverts write protection on a tree.
pub trait PermissionToggler: Send + Sync + 'static {
    fn make_readonly(&self, root: &Path) -> Result<PermissionSnapshot, RepositoryLockError>;
    fn restore(&self, snapshot: &PermissionSnapshot) -> Result<(), RepositoryLockError>;
}

/// Clears `a-w` on every file and directory under the root. Symlinks are
/// neither followed nor changed.
pub struct TreePermissions;

impl TreePermissions {
    fn rollback(applied: &[(PathBuf, u32)]) {
        for (path, mode) in applied.iter().rev() {
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode)) {
                warn!(path = %path.display(), error = %e, "rollback of permission change failed");
            }
        }
    }
}

impl PermissionToggler for TreePermissions {
    fn make_readonly(&self, root: &Path) -> Result<PermissionSnapshot, RepositoryLockError> {
        let mut applied: Vec<(PathBuf, u32)> = Vec::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let step = entry
                .map_err(|e| (root.to_path_buf(), e.to_string()))
                .and_then(|entry| {
                    if entry.path_is_symlink() {
                        return Ok(None);
                    }
                    let path = entry.into_path();
                    let mode = std::fs::symlink_metadata(&path)
                        .map_err(|e| (path.clone(), e.to_string()))?
                        .permissions()
                        .mode();
                    if mode & WRITE_BITS == 0 {
                        return Ok(None);
                    }
                    std::fs::set_permissions(
                        &path,
                        std::fs::Permissions::from_mode(mode & !WRITE_BITS),
                    )
                    .map_err(|e| (path.clone(), e.to_string()))?;
                    Ok(Some((path, mode)))
                });

            match step {
                Ok(Some(changed)) => applied.push(changed),
                Ok(None) => {}
                Err((path, reason)) => {
                    Self::rollback(&applied);
                    return Err(RepositoryLockError::Transition {
                        path: path.display().to_string(),
                        reason,
                    });
                }
            }
        }

        Ok(PermissionSnapshot { entries: applied })
    }

    fn restore(&self, snapshot: &PermissionSnapshot) -> Result<(), RepositoryLockError> {
        let mut first_error = None;
        // children before their directories
        for (path, mode) in snapshot.entries.iter().rev() {
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode)) {
                warn!(path = %path.display(), error = %e, "permission restore failed");
                first_error.get_or_insert(RepositoryLockError::Restore {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Used when read-only enforcement is disabled: holders are still counted.
pub struct NoopPermissions;

impl PermissionToggler for NoopPermissions {
    fn make_readonly(&self, _root: &Path) -> Result<PermissionSnapshot, RepositoryLockError> {
        Ok(PermissionSnapshot::default())
    }

    fn restore(&self, _snapshot: &PermissionSnapshot) -> Result<(), RepositoryLockError> {
        Ok(())
    }
}

#[derive(Default)]
struct SlotState {
    holders: usize,
    snapshot: Option<PermissionSnapshot>,
}

#[derive(Default)]
struct PathSlot {
    state: Mutex<SlotState>,
}

/// Per-path arena of transition locks and holder counts.
pub struct RepoGuard {
    slots: DashMap<PathBuf, Arc<PathSlot>>,
    toggler: Arc<dyn PermissionToggler>,
    lock_timeout: Duration,
}

impl RepoGuard {
    pub fn new(toggler: Arc<dyn PermissionToggler>, lock_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            toggler,
            lock_timeout,
        }
    }

    /// Guard that really toggles permissions, or only counts when `enforce` is false.
    pub fn from_enforcement(enforce: bool, lock_timeout: Duration) -> Self {
        let toggler: Arc<dyn PermissionToggler> = if enforce {
            Arc::new(TreePermissions)
        } else {
            Arc::new(NoopPermissions)
        };
        Self::new(toggler, lock_timeout)
    }

    /// Take a hold on the read-only state of `path`.
    ///
    /// Fails with [`RepositoryLockError`] if the transition lock cannot be
    /// taken within the lock timeout or the tree cannot be made read-only;
    /// a partial transition is rolled back and no hold is recorded.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn acquire(&self, path: &Path) -> Result<AccessHandle, RepositoryLockError> {
        let root = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| RepositoryLockError::Path(format!("{}: {e}", path.display())))?;
        let slot = Arc::clone(
            &*self
                .slots
                .entry(root.clone())
                .or_insert_with(|| Arc::new(PathSlot::default())),
        );
        let toggler = Arc::clone(&self.toggler);
        let timeout = self.lock_timeout;

        // The handle is built inside the blocking task, so a cancelled
        // caller drops it there and the hold is released.
        tokio::task::spawn_blocking(move || enter(slot, toggler, root, timeout))
            .await
            .map_err(|e| RepositoryLockError::Join(e.to_string()))?
    }

    /// Current number of holds on `path`.
    pub fn holders(&self, path: &Path) -> usize {
        let root = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.slots
            .get(&root)
            .map(|slot| slot.state.lock().holders)
            .unwrap_or(0)
    }
}

fn enter(
    slot: Arc<PathSlot>,
    toggler: Arc<dyn PermissionToggler>,
    root: PathBuf,
    timeout: Duration,
) -> Result<AccessHandle, RepositoryLockError> {
    let mut state = slot
        .state
        .try_lock_for(timeout)
        .ok_or(RepositoryLockError::LockTimeout(timeout))?;

    if state.holders == 0 {
        let snapshot = toggler.make_readonly(&root)?;
        debug!(changed = snapshot.len(), "repository made read-only");
        state.snapshot = Some(snapshot);
    }
    state.holders += 1;
    drop(state);

    Ok(AccessHandle {
        root: root.clone(),
        hold: Some(Hold {
            slot,
            toggler,
            root,
            done: false,
        }),
    })
}

fn leave(
    slot: &PathSlot,
    toggler: &dyn PermissionToggler,
    root: &Path,
) -> Result<(), RepositoryLockError> {
    let mut state = slot.state.lock();
    state.holders = state.holders.saturating_sub(1);
    if state.holders > 0 {
        return Ok(());
    }
    match state.snapshot.take() {
        Some(snapshot) => {
            debug!(path = %root.display(), "restoring repository permissions");
            toggler.restore(&snapshot)
        }
        None => Ok(()),
    }
}

/// The counted hold itself. Leaves the slot when dropped if it was not
/// left explicitly, so a release task the runtime never runs still releases.
struct Hold {
    slot: Arc<PathSlot>,
    toggler: Arc<dyn PermissionToggler>,
    root: PathBuf,
    done: bool,
}

impl Hold {
    fn leave(mut self) -> Result<(), RepositoryLockError> {
        self.done = true;
        leave(&self.slot, self.toggler.as_ref(), &self.root)
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(e) = leave(&self.slot, self.toggler.as_ref(), &self.root) {
            warn!(error = %e, "release on drop failed");
        }
    }
}

/// One outstanding hold on a repository's read-only state.
///
/// Release explicitly with [`AccessHandle::release`]. Dropping an unreleased
/// handle hands the release to the blocking pool when a runtime is around,
/// and performs it in place otherwise.
pub struct AccessHandle {
    root: PathBuf,
    hold: Option<Hold>,
}

impl std::fmt::Debug for AccessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessHandle")
            .field("root", &self.root)
            .field("released", &self.hold.is_none())
            .finish()
    }
}

impl AccessHandle {
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub async fn release(mut self) -> Result<(), RepositoryLockError> {
        let Some(hold) = self.hold.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || hold.leave())
            .await
            .map_err(|e| RepositoryLockError::Join(e.to_string()))?
    }
}

impl Drop for AccessHandle {
    fn drop(&mut self) {
        let Some(hold) = self.hold.take() else {
            return;
        };
        warn!(path = %self.root.display(), "access handle dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    if let Err(e) = hold.leave() {
                        warn!(error = %e, "release on drop failed");
                    }
                });
            }
            Err(_) => drop(hold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for_release(guard: &RepoGuard, path: &Path) {
        for _ in 0..200 {
            if guard.holders(path) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hold on {} never released", path.display());
    }

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn set_mode(path: &Path, mode: u32) {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    /// repo/{main.rs 0o644, run.sh 0o755, src/lib.rs 0o640}
    fn sample_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("src")).unwrap();
        std::fs::write(root.join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("run.sh"), "#!/bin/sh").unwrap();
        std::fs::write(root.join("src/lib.rs"), "").unwrap();
        set_mode(&root.join("main.rs"), 0o644);
        set_mode(&root.join("run.sh"), 0o755);
        set_mode(&root.join("src/lib.rs"), 0o640);
        dir
    }

    fn assert_readonly(root: &Path) {
        for p in ["main.rs", "run.sh", "src/lib.rs", "src"] {
            assert_eq!(mode(&root.join(p)) & WRITE_BITS, 0, "{p} still writable");
        }
    }

    fn assert_original(root: &Path) {
        assert_eq!(mode(&root.join("main.rs")), 0o644);
        assert_eq!(mode(&root.join("run.sh")), 0o755);
        assert_eq!(mode(&root.join("src/lib.rs")), 0o640);
    }

    struct CountingToggler {
        applied: AtomicUsize,
        restored: AtomicUsize,
        delay: Duration,
    }

    impl CountingToggler {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                applied: AtomicUsize::new(0),
                restored: AtomicUsize::new(0),
                delay,
            })
        }
    }

    impl PermissionToggler for CountingToggler {
        fn make_readonly(&self, _root: &Path) -> Result<PermissionSnapshot, RepositoryLockError> {
            std::thread::sleep(self.delay);
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(PermissionSnapshot::default())
        }

        fn restore(&self, _snapshot: &PermissionSnapshot) -> Result<(), RepositoryLockError> {
            self.restored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingToggler;

    impl PermissionToggler for FailingToggler {
        fn make_readonly(&self, root: &Path) -> Result<PermissionSnapshot, RepositoryLockError> {
            Err(RepositoryLockError::Transition {
                path: root.display().to_string(),
                reason: "denied".into(),
            })
        }

        fn restore(&self, _snapshot: &PermissionSnapshot) -> Result<(), RepositoryLockError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn acquire_and_release_restores_exact_modes() {
        let repo = sample_repo();
        let guard = RepoGuard::from_enforcement(true, Duration::from_secs(5));

        let handle = guard.acquire(repo.path()).await.unwrap();
        assert_readonly(repo.path());
        assert_eq!(guard.holders(repo.path()), 1);

        handle.release().await.unwrap();
        assert_original(repo.path());
        assert_eq!(guard.holders(repo.path()), 0);
    }

    #[tokio::test]
    async fn second_holder_joins_and_last_one_restores() {
        let repo = sample_repo();
        let toggler = CountingToggler::new(Duration::ZERO);
        let guard = RepoGuard::new(toggler.clone(), Duration::from_secs(5));

        let a = guard.acquire(repo.path()).await.unwrap();
        let b = guard.acquire(repo.path()).await.unwrap();
        assert_eq!(guard.holders(repo.path()), 2);
        assert_eq!(toggler.applied.load(Ordering::SeqCst), 1);

        a.release().await.unwrap();
        assert_eq!(toggler.restored.load(Ordering::SeqCst), 0);
        b.release().await.unwrap();
        assert_eq!(toggler.restored.load(Ordering::SeqCst), 1);
        assert_eq!(guard.holders(repo.path()), 0);
    }

    #[tokio::test]
    async fn overlapping_holds_keep_tree_readonly() {
        let repo = sample_repo();
        let guard = RepoGuard::from_enforcement(true, Duration::from_secs(5));

        let a = guard.acquire(repo.path()).await.unwrap();
        let b = guard.acquire(repo.path()).await.unwrap();
        a.release().await.unwrap();
        assert_readonly(repo.path());
        b.release().await.unwrap();
        assert_original(repo.path());
    }

    #[tokio::test]
    async fn drop_releases_hold() {
        let repo = sample_repo();
        let guard = RepoGuard::from_enforcement(true, Duration::from_secs(5));

        let handle = guard.acquire(repo.path()).await.unwrap();
        drop(handle);
        wait_for_release(&guard, repo.path()).await;
        assert_original(repo.path());
    }

    #[tokio::test]
    async fn cancelled_request_releases_hold() {
        let repo = sample_repo();
        let guard = Arc::new(RepoGuard::from_enforcement(true, Duration::from_secs(5)));

        let task = {
            let guard = Arc::clone(&guard);
            let root = repo.path().to_path_buf();
            tokio::spawn(async move {
                let _handle = guard.acquire(&root).await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        while guard.holders(repo.path()) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_readonly(repo.path());

        task.abort();
        let _ = task.await;
        wait_for_release(&guard, repo.path()).await;
        assert_original(repo.path());
    }

    #[tokio::test]
    async fn drop_outside_runtime_releases_in_place() {
        let repo = sample_repo();
        let guard = RepoGuard::from_enforcement(true, Duration::from_secs(5));

        let handle = guard.acquire(repo.path()).await.unwrap();
        std::thread::spawn(move || drop(handle)).join().unwrap();
        assert_eq!(guard.holders(repo.path()), 0);
        assert_original(repo.path());
    }

    #[tokio::test]
    async fn handle_debug_shows_root() {
        let repo = sample_repo();
        let guard = RepoGuard::from_enforcement(false, Duration::from_secs(1));
        let handle = guard.acquire(repo.path()).await.unwrap();
        let shown = format!("{handle:?}");
        assert!(shown.contains("AccessHandle"));
        assert!(shown.contains("released: false"));
        handle.release().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_holders_never_corrupt_state() {
        let repo = sample_repo();
        let guard = Arc::new(RepoGuard::from_enforcement(true, Duration::from_secs(10)));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let guard = Arc::clone(&guard);
                let root = repo.path().to_path_buf();
                tokio::spawn(async move {
                    let handle = guard.acquire(&root).await.unwrap();
                    assert_readonly(&root);
                    tokio::time::sleep(Duration::from_millis(1 + (i % 4) * 3)).await;
                    handle.release().await.unwrap();
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(guard.holders(repo.path()), 0);
        assert_original(repo.path());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_timeout_while_transition_in_flight() {
        let repo = sample_repo();
        let toggler = CountingToggler::new(Duration::from_millis(500));
        let guard = Arc::new(RepoGuard::new(toggler, Duration::from_millis(50)));

        let first = {
            let guard = Arc::clone(&guard);
            let root = repo.path().to_path_buf();
            tokio::spawn(async move { guard.acquire(&root).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = guard.acquire(repo.path()).await;
        assert!(matches!(second, Err(RepositoryLockError::LockTimeout(_))));

        let handle = first.await.unwrap().unwrap();
        assert_eq!(guard.holders(repo.path()), 1);
        handle.release().await.unwrap();
        assert_eq!(guard.holders(repo.path()), 0);
    }

    #[tokio::test]
    async fn failed_transition_records_no_hold() {
        let repo = sample_repo();
        let guard = RepoGuard::new(Arc::new(FailingToggler), Duration::from_secs(1));

        let err = guard.acquire(repo.path()).await.unwrap_err();
        assert!(matches!(err, RepositoryLockError::Transition { .. }));
        assert_eq!(guard.holders(repo.path()), 0);
    }

    #[tokio::test]
    async fn missing_path_is_rejected() {
        let guard = RepoGuard::from_enforcement(true, Duration::from_secs(1));
        let err = guard
            .acquire(Path::new("/nonexistent/askrepo/repo"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryLockError::Path(_)));
    }

    #[tokio::test]
    async fn disabled_enforcement_only_counts() {
        let repo = sample_repo();
        let guard = RepoGuard::from_enforcement(false, Duration::from_secs(1));

        let handle = guard.acquire(repo.path()).await.unwrap();
        assert_eq!(guard.holders(repo.path()), 1);
        assert_eq!(mode(&repo.path().join("main.rs")), 0o644);
        handle.release().await.unwrap();
        assert_eq!(guard.holders(repo.path()), 0);
    }

    #[test]
    fn already_readonly_entries_are_left_alone() {
        let repo = sample_repo();
        set_mode(&repo.path().join("main.rs"), 0o444);

        let snapshot = TreePermissions.make_readonly(repo.path()).unwrap();
        assert!(!snapshot
            .entries
            .iter()
            .any(|(p, _)| p.ends_with("main.rs")));
        TreePermissions.restore(&snapshot).unwrap();
        assert_eq!(mode(&repo.path().join("main.rs")), 0o444);
        assert_eq!(mode(&repo.path().join("run.sh")), 0o755);
    }

    #[test]
    fn rollback_reverts_applied_changes() {
        let repo = sample_repo();
        let file = repo.path().join("run.sh");
        set_mode(&file, 0o555);
        TreePermissions::rollback(&[(file.clone(), 0o755)]);
        assert_eq!(mode(&file), 0o755);
    }
}
