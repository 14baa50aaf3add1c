use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::limits::SWEEP_INTERVAL_SECS;

/// Periodically expires awaiting-owner reservations past their deadline and
/// abandons failed payments past their grace period. Runs independently of any
/// client session; reads settle the same transitions lazily in between.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let now = crate::engine::now_ms();
        let settled = engine.sweep_due(now).await;
        if settled > 0 {
            info!("reaper settled {settled} reservations");
        } else {
            debug!("reaper: nothing due");
        }
    }
}

/// Compacts the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
