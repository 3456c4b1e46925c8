//! Snapshot lifecycle management - expiry sweep

use std::sync::Arc;
use std::time::Duration;

use live_snapshots::clock::Clock;
use live_snapshots::storage::SnapshotStore;
use tracing::{debug, error, info, warn};

use crate::AppState;

/// Delete snapshots whose expiry has passed.
///
/// With `remove_expired` off nothing is deleted; expiry is left to the owner
/// who shared the snapshot.
pub async fn sweep_once(
    store: &dyn SnapshotStore,
    clock: &dyn Clock,
    remove_expired: bool,
) -> live_snapshots::Result<u64> {
    if !remove_expired {
        warn!("Expired snapshot removal is disabled; pass --remove-expired to enable the sweep");
        return Ok(0);
    }

    let deleted = store.delete_expired(clock.now()).await?;
    if deleted > 0 {
        info!("Cleaned up {} expired snapshots", deleted);
    }
    Ok(deleted)
}

/// Background task that sweeps expired snapshots
pub async fn cleanup_task(state: Arc<AppState>, interval: Duration, remove_expired: bool) {
    info!("Starting cleanup task with interval: {:?}", interval);

    loop {
        tokio::time::sleep(interval).await;
        debug!("Running snapshot cleanup...");

        if let Err(e) = sweep_once(state.store.as_ref(), state.clock.as_ref(), remove_expired).await
        {
            error!("Cleanup task error: {}", e);
        }
    }
}
