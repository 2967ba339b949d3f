use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use askrepo_store::SessionStore;

/// Periodically drop expired sessions until `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let store = Arc::clone(&store);
            let backend = store.backend();
            match tokio::task::spawn_blocking(move || store.purge_expired()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => info!(backend, removed, "expired sessions purged"),
                Ok(Err(e)) => warn!(backend, error = %e, "session purge failed"),
                Err(e) => warn!(backend, error = %e, "session purge task failed"),
            }
        }
    })
}
