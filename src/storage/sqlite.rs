//! SQLite persistence backend.
//!
//! The dashboard owns this schema; the service reads items and policy rows
//! at probe rate (shielded by the item cache) and writes probe outcomes
//! back. WAL mode keeps reads cheap while monitor loops write.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info, instrument};

use super::backend::MonitorStore;
use super::error::{StorageError, StorageResult};
use super::schema::{AlertConfig, MonitorItem, MonitorSettings};

const ITEM_COLUMNS: &str = r#"id, name, enable, url_check, type, check_interval_seconds,
       user_id, last_check_status, count_online, count_offline, last_check_time,
       result_valid, result_error, "maxAlertCount", "stopTo", "forceRestart",
       allow_alert_for_consecutive_error, deleted_at, created_at, updated_at"#;

/// SQLite-backed [`MonitorStore`].
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing), configure and migrate the database.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>, pool_size: u32) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests).
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
        raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
    }

    fn map_item(row: &SqliteRow) -> StorageResult<MonitorItem> {
        Ok(MonitorItem {
            id: row.get("id"),
            name: row.get::<Option<String>, _>("name").unwrap_or_default(),
            enable: row.get::<i64, _>("enable") != 0,
            url_check: row
                .get::<Option<String>, _>("url_check")
                .unwrap_or_default(),
            check_type: row.get::<Option<String>, _>("type").unwrap_or_default(),
            check_interval_seconds: row.get("check_interval_seconds"),
            user_id: row.get::<Option<i64>, _>("user_id").unwrap_or(0),
            last_check_status: row.get("last_check_status"),
            count_online: row.get::<Option<i64>, _>("count_online").unwrap_or(0),
            count_offline: row.get::<Option<i64>, _>("count_offline").unwrap_or(0),
            last_check_time: Self::parse_timestamp(row.get("last_check_time")),
            result_valid: row.get("result_valid"),
            result_error: row.get("result_error"),
            max_alert_count: row.get("maxAlertCount"),
            stop_to: Self::parse_timestamp(row.get("stopTo")),
            force_restart: row.get::<Option<i64>, _>("forceRestart").unwrap_or(0) != 0,
            allow_alert_for_consecutive_error: row.get("allow_alert_for_consecutive_error"),
            deleted_at: Self::parse_timestamp(row.get("deleted_at")),
            created_at: Self::parse_timestamp(row.get("created_at")),
            updated_at: Self::parse_timestamp(row.get("updated_at")),
        })
    }

    fn map_alert_config(row: &SqliteRow) -> AlertConfig {
        AlertConfig {
            id: row.get("id"),
            name: row.get("name"),
            user_id: row.get::<Option<i64>, _>("user_id").unwrap_or(0),
            alert_type: row
                .get::<Option<String>, _>("alert_type")
                .unwrap_or_default(),
            alert_config: row.get("alert_config"),
        }
    }
}

#[async_trait]
impl MonitorStore for SqliteStore {
    #[instrument(skip(self))]
    async fn list_enabled_items(&self) -> StorageResult<Vec<MonitorItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM monitor_items \
             WHERE enable = 1 AND deleted_at IS NULL ORDER BY id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_item).collect()
    }

    #[instrument(skip(self))]
    async fn list_all_items(&self, limit: Option<usize>) -> StorageResult<Vec<MonitorItem>> {
        let mut sql = format!(
            "SELECT {ITEM_COLUMNS} FROM monitor_items \
             WHERE deleted_at IS NULL ORDER BY id"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_item).collect()
    }

    #[instrument(skip(self))]
    async fn get_item(&self, id: i64) -> StorageResult<Option<MonitorItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM monitor_items WHERE id = ? AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::map_item).transpose()
    }

    #[instrument(skip(self, error_msg, valid_msg))]
    async fn update_probe_result(
        &self,
        id: i64,
        status: i32,
        error_msg: Option<&str>,
        valid_msg: Option<&str>,
    ) -> StorageResult<()> {
        // Counter increments ride the same statement so the row update is
        // atomic: exactly one of count_online/count_offline moves per probe.
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE monitor_items
            SET last_check_status = ?2,
                last_check_time = ?3,
                result_error = ?4,
                result_valid = ?5,
                count_online = count_online + (CASE WHEN ?2 = 1 THEN 1 ELSE 0 END),
                count_offline = count_offline + (CASE WHEN ?2 = -1 THEN 1 ELSE 0 END),
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(&now)
        .bind(error_msg)
        .bind(valid_msg)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_counters(&self, id: i64) -> StorageResult<()> {
        sqlx::query("UPDATE monitor_items SET count_online = 0, count_offline = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn alert_config_for_item(
        &self,
        id: i64,
        alert_type: &str,
    ) -> StorageResult<Option<AlertConfig>> {
        let row = sqlx::query(
            r#"
            SELECT mc.id, mc.name, mc.user_id, mc.alert_type, mc.alert_config
            FROM monitor_configs mc
            JOIN monitor_and_configs mac ON mc.id = mac.config_id
            WHERE mac.monitor_item_id = ?
              AND mc.alert_type = ?
              AND mc.deleted_at IS NULL
              AND mac.deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(id)
        .bind(alert_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::map_alert_config))
    }

    #[instrument(skip(self))]
    async fn alert_configs_for_item(&self, id: i64) -> StorageResult<Vec<AlertConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT mc.id, mc.name, mc.user_id, mc.alert_type, mc.alert_config
            FROM monitor_configs mc
            JOIN monitor_and_configs mac ON mc.id = mac.config_id
            WHERE mac.monitor_item_id = ?
              AND mc.deleted_at IS NULL
              AND mac.deleted_at IS NULL
            ORDER BY mc.id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::map_alert_config).collect())
    }

    #[instrument(skip(self))]
    async fn monitor_settings(&self, user_id: i64) -> StorageResult<Option<MonitorSettings>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, timezone, alert_time_ranges, global_stop_alert_to, firebase_token
            FROM monitor_settings
            WHERE user_id = ? AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MonitorSettings {
            user_id: row.get("user_id"),
            timezone: row.get("timezone"),
            alert_time_ranges: row.get("alert_time_ranges"),
            global_stop_alert_to: Self::parse_timestamp(row.get("global_stop_alert_to")),
            firebase_token: row.get("firebase_token"),
        }))
    }

    #[instrument(skip(self))]
    async fn user_email(&self, user_id: i64) -> StorageResult<Option<String>> {
        let row = sqlx::query("SELECT email FROM users WHERE id = ? AND deleted_at IS NULL")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| row.get::<Option<String>, _>("email")))
    }

    #[instrument(skip(self))]
    async fn push_token(&self, user_id: i64) -> StorageResult<Option<String>> {
        Ok(self
            .monitor_settings(user_id)
            .await?
            .and_then(|s| s.firebase_token)
            .filter(|t| !t.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("test.db"), 2)
            .await
            .unwrap();
        (store, dir)
    }

    async fn seed_item(store: &SqliteStore, id: i64, enable: bool) {
        sqlx::query(
            r#"INSERT INTO monitor_items (id, name, enable, url_check, type, check_interval_seconds, user_id)
               VALUES (?, ?, ?, 'https://example.com', 'ping_web', 60, 1)"#,
        )
        .bind(id)
        .bind(format!("item-{id}"))
        .bind(enable as i64)
        .execute(&store.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_list_enabled_excludes_disabled_and_deleted() {
        let (store, _dir) = test_store().await;
        seed_item(&store, 1, true).await;
        seed_item(&store, 2, false).await;
        seed_item(&store, 3, true).await;
        sqlx::query("UPDATE monitor_items SET deleted_at = '2025-01-01T00:00:00Z' WHERE id = 3")
            .execute(&store.pool)
            .await
            .unwrap();

        let items = store.list_enabled_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 1);

        // The cache read still sees the disabled (but not the deleted) item.
        let all = store.list_all_items(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_update_probe_result_increments_exactly_one_counter() {
        let (store, _dir) = test_store().await;
        seed_item(&store, 1, true).await;

        store
            .update_probe_result(1, 1, None, Some("HTTP 200"))
            .await
            .unwrap();
        let item = store.get_item(1).await.unwrap().unwrap();
        assert_eq!(item.count_online, 1);
        assert_eq!(item.count_offline, 0);
        assert_eq!(item.last_check_status, Some(1));
        assert!(item.last_check_time.is_some());
        assert_eq!(item.result_valid.as_deref(), Some("HTTP 200"));

        store
            .update_probe_result(1, -1, Some("connect refused"), None)
            .await
            .unwrap();
        let item = store.get_item(1).await.unwrap().unwrap();
        assert_eq!(item.count_online, 1);
        assert_eq!(item.count_offline, 1);
        assert_eq!(item.last_check_status, Some(-1));
        assert_eq!(item.result_error.as_deref(), Some("connect refused"));
    }

    #[tokio::test]
    async fn test_reset_counters() {
        let (store, _dir) = test_store().await;
        seed_item(&store, 1, true).await;
        store.update_probe_result(1, 1, None, None).await.unwrap();
        store.reset_counters(1).await.unwrap();
        let item = store.get_item(1).await.unwrap().unwrap();
        assert_eq!(item.count_online, 0);
        assert_eq!(item.count_offline, 0);
    }

    #[tokio::test]
    async fn test_alert_config_join_skips_deleted_links() {
        let (store, _dir) = test_store().await;
        seed_item(&store, 1, true).await;
        sqlx::query(
            "INSERT INTO monitor_configs (id, name, alert_type, alert_config) \
             VALUES (10, 'tg', 'telegram', '123:ABC,42'), (11, 'hook', 'webhook', 'https://h.example/x')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO monitor_and_configs (monitor_item_id, config_id, deleted_at) \
             VALUES (1, 10, NULL), (1, 11, '2025-01-01T00:00:00Z')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let tg = store.alert_config_for_item(1, "telegram").await.unwrap();
        assert!(tg.is_some());
        // Deleting the link disables the channel for the item.
        let hook = store.alert_config_for_item(1, "webhook").await.unwrap();
        assert!(hook.is_none());

        let all = store.alert_configs_for_item(1).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_settings_and_push_token() {
        let (store, _dir) = test_store().await;
        sqlx::query(
            "INSERT INTO monitor_settings (user_id, timezone, alert_time_ranges, firebase_token) \
             VALUES (5, '7', '09:00-18:00', 'device-token-1')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let settings = store.monitor_settings(5).await.unwrap().unwrap();
        assert_eq!(settings.timezone.as_deref(), Some("7"));
        assert_eq!(settings.alert_time_ranges.as_deref(), Some("09:00-18:00"));
        assert_eq!(store.push_token(5).await.unwrap().as_deref(), Some("device-token-1"));
        assert!(store.monitor_settings(99).await.unwrap().is_none());
    }
}
