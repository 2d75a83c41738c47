use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::observability;

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            info!("background WAL compaction done");
        }
    }
}

/// Compact when at least `threshold` events were appended since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            // Next tick tries again.
            warn!(appends, error = %e, "WAL compaction failed");
            false
        }
    }
}
