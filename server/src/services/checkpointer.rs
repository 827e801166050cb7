use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CHECKPOINT_INTERVAL_SECS;
use crate::state::Source;
use crate::store::CheckpointMode;

/// Cooperative WAL maintenance: PASSIVE every ~15 s, upgraded to RESTART
/// when frames were left behind. Failures are logged and retried on the
/// next tick.
pub async fn run(source: Arc<Source>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(CHECKPOINT_INTERVAL_SECS));
    // Consume the immediate tick; the store checkpointed on open.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        match source.store.checkpoint(CheckpointMode::Passive).await {
            Ok(result) if result.fully_reclaimed() => {
                debug!(source = %source.name, frames = result.checkpointed_frames, "wal checkpoint");
            }
            Ok(result) => {
                debug!(
                    source = %source.name,
                    wal_frames = result.wal_frames,
                    checkpointed = result.checkpointed_frames,
                    "passive checkpoint incomplete, upgrading to restart"
                );
                if let Err(e) = source.store.checkpoint(CheckpointMode::Restart).await {
                    warn!(source = %source.name, error = %e, "restart checkpoint failed");
                }
            }
            Err(e) => {
                warn!(source = %source.name, error = %e, "passive checkpoint failed");
            }
        }
    }
}
