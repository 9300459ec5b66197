use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

/// How often the compactor looks at the journal.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the journal if at least `threshold` events were appended since
/// the last compaction. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted journal after {appends} appends");
    Ok(true)
}

/// Background task that keeps the journal from growing without bound.
/// A busy engine just defers compaction to the next tick.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_due(&engine, threshold).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => debug!("compaction deferred: {e}"),
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemStore;
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_room(no: &str) -> NewRoom {
        NewRoom { room_no: no.into(), capacity: 2 }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::with_default_wait(MemStore::open(&path).await.unwrap());

        let room = engine.create_room(new_room("101")).await.unwrap();
        assert!(!compact_if_due(&engine, 3).await.unwrap());

        for no in ["102", "103"] {
            let r = engine.create_room(new_room(no)).await.unwrap();
            engine.delete_room(r.id).await.unwrap();
        }
        assert!(compact_if_due(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let reopened = Engine::with_default_wait(MemStore::open(&path).await.unwrap());
        let rooms = reopened.list_rooms().await;
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, room.id);
    }

    #[tokio::test]
    async fn ephemeral_store_never_compacts() {
        let engine = Engine::with_default_wait(MemStore::ephemeral());
        engine.create_room(new_room("101")).await.unwrap();
        assert!(!compact_if_due(&engine, 0).await.unwrap());
    }
}
