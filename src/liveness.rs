//! Server liveness: periodic heartbeats and removal of servers that stopped
//! sending them. Registration itself happens in
//! [`JobStore::start_storage`](crate::storage::JobStore::start_storage).

use crate::storage::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Refresh this server's heartbeat every `interval` until shutdown.
pub(crate) async fn run_heartbeat(
    store: Arc<dyn JobStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown.cancelled() => break,
        }

        match store.update_heartbeat().await {
            Ok(()) => trace!("Heartbeat sent"),
            Err(error) => error!(%error, "Failed to send heartbeat"),
        }
    }

    debug!("Heartbeat loop stopped");
}

/// Every `interval`, remove servers whose heartbeat is older than `purge_after`.
pub(crate) async fn run_maintenance(
    store: Arc<dyn JobStore>,
    interval: Duration,
    purge_after: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown.cancelled() => break,
        }

        match store.remove_inactive_servers(purge_after).await {
            Ok(0) => trace!("No inactive servers"),
            Ok(removed) => info!(removed, "Removed inactive servers"),
            Err(error) => error!(%error, "Failed to remove inactive servers"),
        }
    }

    debug!("Server maintenance loop stopped");
}
