use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::{Store, StoreError};

/// Background task that rewrites the WAL once enough blocks have been appended.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(store: &Store, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_slot() -> NewSlot {
        NewSlot {
            date: NaiveDate::from_ymd_opt(2025, 9, 21).unwrap(),
            time_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            time_end: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            capacity: 1,
            zone: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Store::open(&path, Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            store.atomic(|txn| txn.insert_slot(new_slot())).await.unwrap();
        }
        assert!(!compact_if_needed(&store, 4).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 3);

        store.atomic(|txn| txn.insert_slot(new_slot())).await.unwrap();
        assert!(compact_if_needed(&store, 4).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);

        store.shutdown().await.unwrap();
        let reopened = Store::open(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(reopened.read(|t| t.slot_count()).await, 4);
    }

    #[tokio::test]
    async fn zero_threshold_disables_compaction() {
        let path = test_wal_path("disabled.wal");
        let store = Store::open(&path, Duration::from_secs(5)).unwrap();
        store.atomic(|txn| txn.insert_slot(new_slot())).await.unwrap();
        assert!(!compact_if_needed(&store, 0).await.unwrap());
    }
}
