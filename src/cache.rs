//! Item cache.
//!
//! Shields the database from probe-rate reads: a background task refreshes
//! a full `id → MonitorItem` snapshot every second, and readers clone an
//! `Arc` under a short lock (pointer swap, no per-read queries). Lookups
//! outside the freshness window fall back to the store and opportunistically
//! patch the snapshot, so the scheduler keeps making progress even when the
//! refresher is wedged.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use crate::storage::StoreHandle;
use crate::storage::schema::MonitorItem;

/// Refresh cadence of the background task.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// A snapshot older than this is stale and reads bypass it.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5);

type Snapshot = Arc<HashMap<i64, MonitorItem>>;

struct CacheInner {
    items: Snapshot,
    refreshed_at: Option<Instant>,
}

/// Snapshot cache over all non-deleted monitor items.
pub struct ItemCache {
    store: StoreHandle,
    /// Optional process-wide working-set cap (`--limit`).
    limit: Option<usize>,
    inner: RwLock<CacheInner>,
}

impl ItemCache {
    pub fn new(store: StoreHandle, limit: Option<usize>) -> Self {
        Self {
            store,
            limit,
            inner: RwLock::new(CacheInner {
                items: Arc::new(HashMap::new()),
                refreshed_at: None,
            }),
        }
    }

    /// Replace the snapshot from a fresh store read.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> crate::storage::StorageResult<usize> {
        let items = self.store.list_all_items(self.limit).await?;
        let count = items.len();
        let map: HashMap<i64, MonitorItem> = items.into_iter().map(|it| (it.id, it)).collect();

        let mut inner = self.inner.write().await;
        inner.items = Arc::new(map);
        inner.refreshed_at = Some(Instant::now());
        Ok(count)
    }

    /// Whether the snapshot is within the freshness window.
    pub async fn is_fresh(&self) -> bool {
        let inner = self.inner.read().await;
        matches!(inner.refreshed_at, Some(at) if at.elapsed() <= FRESHNESS_WINDOW)
    }

    /// Current snapshot (may be stale; callers that need freshness use
    /// [`ItemCache::get`]).
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.items.clone()
    }

    /// Number of cached items.
    pub async fn len(&self) -> usize {
        self.inner.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Look up one item, falling back to the store when the snapshot is
    /// stale. The fallback read patches the snapshot in place.
    pub async fn get(&self, id: i64) -> Option<MonitorItem> {
        if self.is_fresh().await {
            return self.inner.read().await.items.get(&id).cloned();
        }

        warn!(monitor_id = id, "cache stale, falling back to persistence read");
        match self.store.get_item(id).await {
            Ok(found) => {
                let mut inner = self.inner.write().await;
                let mut map = (*inner.items).clone();
                match &found {
                    Some(item) => {
                        map.insert(id, item.clone());
                    }
                    None => {
                        map.remove(&id);
                    }
                }
                inner.items = Arc::new(map);
                found
            }
            Err(e) => {
                // Last resort: serve the stale entry rather than nothing.
                warn!(monitor_id = id, "persistence fallback failed: {e}");
                self.inner.read().await.items.get(&id).cloned()
            }
        }
    }

    /// Background refresh loop; runs until the shutdown signal flips.
    pub async fn run_refresher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("cache refresher started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("cache refresh failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("cache refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn item(id: i64, enable: bool) -> MonitorItem {
        MonitorItem {
            id,
            name: format!("item-{id}"),
            enable,
            url_check: "https://example.com".to_string(),
            check_type: "ping_web".to_string(),
            check_interval_seconds: Some(60),
            user_id: 0,
            last_check_status: None,
            count_online: 0,
            count_offline: 0,
            last_check_time: None,
            result_valid: None,
            result_error: None,
            max_alert_count: None,
            stop_to: None,
            force_restart: false,
            allow_alert_for_consecutive_error: None,
            deleted_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_builds_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.insert_item(item(1, true));
        store.insert_item(item(2, false));

        let cache = ItemCache::new(store, None);
        assert_eq!(cache.refresh().await.unwrap(), 2);
        assert!(cache.is_fresh().await);
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(1).await.is_some());
    }

    #[tokio::test]
    async fn test_limit_caps_working_set() {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=5 {
            store.insert_item(item(id, true));
        }

        let cache = ItemCache::new(store, Some(3));
        cache.refresh().await.unwrap();
        assert_eq!(cache.len().await, 3);
        // Lowest ids win (store orders by id).
        assert!(cache.snapshot().await.contains_key(&1));
        assert!(!cache.snapshot().await.contains_key(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new());
        store.insert_item(item(1, true));

        let cache = ItemCache::new(store.clone(), None);
        cache.refresh().await.unwrap();

        // Edit behind the cache's back, then let it go stale.
        store.update_item(1, |it| it.name = "renamed".to_string());
        tokio::time::advance(FRESHNESS_WINDOW + Duration::from_secs(1)).await;

        assert!(!cache.is_fresh().await);
        let got = cache.get(1).await.unwrap();
        assert_eq!(got.name, "renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_serves_stale_entry() {
        let store = Arc::new(MemoryStore::new());
        store.insert_item(item(1, true));

        let cache = ItemCache::new(store.clone(), None);
        cache.refresh().await.unwrap();

        store.set_poisoned(true);
        tokio::time::advance(FRESHNESS_WINDOW + Duration::from_secs(1)).await;

        // The scheduler must still make progress on the stale snapshot.
        assert!(cache.get(1).await.is_some());
    }
}
