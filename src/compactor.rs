use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::BookingStore;

/// Background task that rewrites the journal once enough appends pile up.
pub async fn run_compactor(store: Arc<BookingStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Compact if at least `threshold` events were appended since the last
/// rewrite. Returns whether a compaction ran.
pub async fn compact_if_due(store: &BookingStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        debug!("compactor: {appends} appends, below threshold {threshold}");
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("journal compacted after {appends} appends");
            true
        }
        Err(e) => {
            warn!("journal compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::model::*;
    use crate::store::ProviderRepository;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_journal_path("threshold.wal");
        let store = BookingStore::open(&path).unwrap();
        let id = ProviderRef::parse("dr-a");
        for name in ["A", "B", "C"] {
            let mut p = Provider::new(id.clone());
            p.name = Some(name.into());
            store.upsert_provider(p).await.unwrap();
        }

        assert!(!compact_if_due(&store, 10).await);
        assert!(compact_if_due(&store, 3).await);
        assert_eq!(store.appends_since_compact().await, 0);

        drop(store);
        let reopened = BookingStore::open(&path).unwrap();
        assert_eq!(reopened.get_provider(&id).await.unwrap().name.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn in_memory_store_never_compacts() {
        let store = BookingStore::in_memory();
        assert!(!compact_if_due(&store, 1).await);
    }
}
