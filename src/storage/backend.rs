//! Persistence adapter trait.
//!
//! A thin read/write surface over the monitoring schema; no business logic
//! lives here. The scheduler, cache, policy and dispatchers all talk to
//! this trait, so tests can swap the SQLite backend for the in-memory one.

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::{AlertConfig, MonitorItem, MonitorSettings};

/// Trait for persistence backends.
///
/// Implementations must be `Send + Sync`; they are shared across the
/// scheduler, cache refresher and dispatcher tasks. All reads exclude
/// soft-deleted rows.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// All enabled, non-deleted items ordered by id.
    async fn list_enabled_items(&self) -> StorageResult<Vec<MonitorItem>>;

    /// All non-deleted items ordered by id, optionally capped.
    ///
    /// This is the cache-refresh read; `limit` implements the process-wide
    /// `--limit` working-set cap.
    async fn list_all_items(&self, limit: Option<usize>) -> StorageResult<Vec<MonitorItem>>;

    /// A single item by id (`None` when missing or soft-deleted).
    async fn get_item(&self, id: i64) -> StorageResult<Option<MonitorItem>>;

    /// Record one probe outcome.
    ///
    /// In a single statement: set `last_check_status`, `last_check_time =
    /// now`, `result_error`, `result_valid`, and increment exactly one of
    /// `count_online` / `count_offline` depending on `status` (1 or -1).
    /// Must be atomic for the row.
    async fn update_probe_result(
        &self,
        id: i64,
        status: i32,
        error_msg: Option<&str>,
        valid_msg: Option<&str>,
    ) -> StorageResult<()>;

    /// Zero both rolling counters.
    async fn reset_counters(&self, id: i64) -> StorageResult<()>;

    /// The first linked alert config of the given channel type for an item.
    async fn alert_config_for_item(
        &self,
        id: i64,
        alert_type: &str,
    ) -> StorageResult<Option<AlertConfig>>;

    /// All linked alert configs for an item.
    async fn alert_configs_for_item(&self, id: i64) -> StorageResult<Vec<AlertConfig>>;

    /// Per-user alert policy settings.
    async fn monitor_settings(&self, user_id: i64) -> StorageResult<Option<MonitorSettings>>;

    /// The user's email address, if any.
    async fn user_email(&self, user_id: i64) -> StorageResult<Option<String>>;

    /// The user's push device token, if any.
    async fn push_token(&self, user_id: i64) -> StorageResult<Option<String>>;
}
