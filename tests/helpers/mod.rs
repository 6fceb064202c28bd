//! Shared test fixtures.

use std::sync::Arc;

use uptimed::MonitorItem;
use uptimed::alerts::Channel;
use uptimed::notifiers::{AlertContext, AlertKind, DispatchOutcome, Dispatcher};
use uptimed::storage::schema::AlertConfig;

/// Build a monitor item with sensible defaults.
pub fn item(id: i64) -> MonitorItem {
    MonitorItem {
        id,
        name: format!("item-{id}"),
        enable: true,
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

pub fn telegram_config(monitor_id: i64) -> (i64, AlertConfig) {
    (
        monitor_id,
        AlertConfig {
            id: 100 + monitor_id,
            name: Some("tg".to_string()),
            user_id: 0,
            alert_type: "telegram".to_string(),
            alert_config: Some("123:ABC,42".to_string()),
        },
    )
}

pub fn webhook_config(monitor_id: i64, url: &str) -> (i64, AlertConfig) {
    (
        monitor_id,
        AlertConfig {
            id: 200 + monitor_id,
            name: Some("ops hook".to_string()),
            user_id: 0,
            alert_type: "webhook".to_string(),
            alert_config: Some(url.to_string()),
        },
    )
}

/// Calls recorded by a [`RecordingDispatcher`].
pub type RecordedCalls = Arc<std::sync::Mutex<Vec<(AlertKind, u32)>>>;

/// Dispatcher that records every context it is asked to deliver.
pub struct RecordingDispatcher {
    channel: Channel,
    calls: RecordedCalls,
}

impl RecordingDispatcher {
    pub fn new(channel: Channel) -> (Arc<dyn Dispatcher>, RecordedCalls) {
        let calls: RecordedCalls = Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                channel,
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, ctx: &AlertContext) -> DispatchOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.kind, ctx.consecutive_errors));
        DispatchOutcome::Sent
    }
}
