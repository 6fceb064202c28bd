//! In-memory persistence backend (no durability).
//!
//! Implements the full [`MonitorStore`] surface over hash maps so the
//! scheduler, cache and dispatchers can be driven in tests without a
//! database file.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::backend::MonitorStore;
use super::error::{StorageError, StorageResult};
use super::schema::{AlertConfig, MonitorItem, MonitorSettings};

#[derive(Default)]
struct Inner {
    items: HashMap<i64, MonitorItem>,
    configs: HashMap<i64, Vec<AlertConfig>>,
    settings: HashMap<i64, MonitorSettings>,
    emails: HashMap<i64, String>,
    /// When set, every operation fails; used to exercise fallback paths.
    poisoned: bool,
}

/// In-memory [`MonitorStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_item(&self, item: MonitorItem) {
        self.inner.write().unwrap().items.insert(item.id, item);
    }

    pub fn remove_item(&self, id: i64) {
        self.inner.write().unwrap().items.remove(&id);
    }

    /// Edit an item in place (test hook for config-change scenarios).
    pub fn update_item(&self, id: i64, mutate: impl FnOnce(&mut MonitorItem)) {
        if let Some(item) = self.inner.write().unwrap().items.get_mut(&id) {
            mutate(item);
        }
    }

    pub fn insert_alert_config(&self, monitor_item_id: i64, config: AlertConfig) {
        self.inner
            .write()
            .unwrap()
            .configs
            .entry(monitor_item_id)
            .or_default()
            .push(config);
    }

    pub fn insert_settings(&self, settings: MonitorSettings) {
        self.inner
            .write()
            .unwrap()
            .settings
            .insert(settings.user_id, settings);
    }

    pub fn insert_email(&self, user_id: i64, email: &str) {
        self.inner
            .write()
            .unwrap()
            .emails
            .insert(user_id, email.to_string());
    }

    /// Make every subsequent operation fail (and `false` to heal).
    pub fn set_poisoned(&self, poisoned: bool) {
        self.inner.write().unwrap().poisoned = poisoned;
    }

    fn check(&self, inner: &Inner) -> StorageResult<()> {
        if inner.poisoned {
            Err(StorageError::QueryFailed("memory store poisoned".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn list_enabled_items(&self) -> StorageResult<Vec<MonitorItem>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        let mut items: Vec<_> = inner
            .items
            .values()
            .filter(|it| it.enable && it.deleted_at.is_none())
            .cloned()
            .collect();
        items.sort_by_key(|it| it.id);
        Ok(items)
    }

    async fn list_all_items(&self, limit: Option<usize>) -> StorageResult<Vec<MonitorItem>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        let mut items: Vec<_> = inner
            .items
            .values()
            .filter(|it| it.deleted_at.is_none())
            .cloned()
            .collect();
        items.sort_by_key(|it| it.id);
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn get_item(&self, id: i64) -> StorageResult<Option<MonitorItem>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        Ok(inner
            .items
            .get(&id)
            .filter(|it| it.deleted_at.is_none())
            .cloned())
    }

    async fn update_probe_result(
        &self,
        id: i64,
        status: i32,
        error_msg: Option<&str>,
        valid_msg: Option<&str>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.poisoned {
            return Err(StorageError::QueryFailed("memory store poisoned".to_string()));
        }
        if let Some(item) = inner.items.get_mut(&id) {
            item.last_check_status = Some(status);
            item.last_check_time = Some(Utc::now());
            item.result_error = error_msg.map(str::to_string);
            item.result_valid = valid_msg.map(str::to_string);
            if status == 1 {
                item.count_online += 1;
            } else if status == -1 {
                item.count_offline += 1;
            }
            item.updated_at = item.last_check_time;
        }
        Ok(())
    }

    async fn reset_counters(&self, id: i64) -> StorageResult<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(item) = inner.items.get_mut(&id) {
            item.count_online = 0;
            item.count_offline = 0;
        }
        Ok(())
    }

    async fn alert_config_for_item(
        &self,
        id: i64,
        alert_type: &str,
    ) -> StorageResult<Option<AlertConfig>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        Ok(inner
            .configs
            .get(&id)
            .and_then(|cfgs| cfgs.iter().find(|c| c.alert_type == alert_type))
            .cloned())
    }

    async fn alert_configs_for_item(&self, id: i64) -> StorageResult<Vec<AlertConfig>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        Ok(inner.configs.get(&id).cloned().unwrap_or_default())
    }

    async fn monitor_settings(&self, user_id: i64) -> StorageResult<Option<MonitorSettings>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        Ok(inner.settings.get(&user_id).cloned())
    }

    async fn user_email(&self, user_id: i64) -> StorageResult<Option<String>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        Ok(inner.emails.get(&user_id).cloned())
    }

    async fn push_token(&self, user_id: i64) -> StorageResult<Option<String>> {
        let inner = self.inner.read().unwrap();
        self.check(&inner)?;
        Ok(inner
            .settings
            .get(&user_id)
            .and_then(|s| s.firebase_token.clone())
            .filter(|t| !t.trim().is_empty()))
    }
}
