//! Chat (Telegram) dispatcher.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, instrument};

use crate::alerts::{AlertRegistry, Channel, ThrottleCurve};
use crate::config::Settings;
use crate::policy::PolicyHandle;
use crate::storage::StoreHandle;
use crate::storage::schema::ChannelConfig;
use crate::util::admin_edit_url;

use super::{
    AlertContext, AlertKind, DispatchOutcome, Dispatcher, policy_gate, post_json_with_backoff,
};

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSPORT_RETRIES: u32 = 2;

pub struct TelegramDispatcher {
    client: reqwest::Client,
    store: StoreHandle,
    registry: Arc<AlertRegistry>,
    policy: PolicyHandle,
    settings: Arc<Settings>,
    curve: ThrottleCurve,
    api_base: String,
}

impl TelegramDispatcher {
    pub fn new(
        client: reqwest::Client,
        store: StoreHandle,
        registry: Arc<AlertRegistry>,
        policy: PolicyHandle,
        settings: Arc<Settings>,
    ) -> Self {
        let curve = ThrottleCurve {
            extended_threshold: settings.count_send_alert_before_extended_interval,
            extended_interval: Duration::from_secs(settings.extended_alert_interval_minutes * 60),
        };
        Self {
            client,
            store,
            registry,
            policy,
            settings,
            curve,
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    /// Point at a different Bot API endpoint (self-hosted gateways).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Database config first, environment fallback second.
    async fn resolve_config(&self, monitor_id: i64) -> Option<(String, String)> {
        match self.store.alert_config_for_item(monitor_id, "telegram").await {
            Ok(Some(config)) => {
                if let Some(ChannelConfig::Telegram { bot_token, chat_id }) = config.parse() {
                    debug!(monitor_id, "using database telegram config");
                    return Some((bot_token, chat_id));
                }
                debug!(monitor_id, "telegram config present but invalid, trying env fallback");
            }
            Ok(None) => {}
            Err(e) => {
                debug!(monitor_id, "telegram config lookup failed: {e}");
            }
        }

        match (
            self.settings.telegram_bot_token.clone(),
            self.settings.telegram_chat_id.clone(),
        ) {
            (Some(token), Some(chat)) => Some((token, chat)),
            _ => None,
        }
    }

    fn error_text(&self, ctx: &AlertContext) -> String {
        let admin_url = admin_edit_url(&self.settings.admin_domain, ctx.item.id);
        format!(
            "\u{1F534} <b>Service Alert</b>\n\n\
             <b>Service:</b> {}\n\
             <b>URL:</b> {}\n\
             <b>Error:</b> {} (Consecutive errors: {})\n\n\
             <a href=\"{admin_url}\">Manage monitor</a>",
            ctx.item.name, ctx.item.url_check, ctx.message, ctx.consecutive_errors
        )
    }

    fn recovery_text(&self, ctx: &AlertContext) -> String {
        let admin_url = admin_edit_url(&self.settings.admin_domain, ctx.item.id);
        format!(
            "\u{2705} <b>Service Recovered</b>\n\n\
             <b>Service:</b> {}\n\
             <b>URL:</b> {}\n\
             <b>Status:</b> {}\n\n\
             <a href=\"{admin_url}\">Manage monitor</a>",
            ctx.item.name, ctx.item.url_check, ctx.message
        )
    }

    async fn send(&self, bot_token: &str, chat_id: &str, text: String) -> Result<(), String> {
        let url = format!("{}/bot{bot_token}/sendMessage", self.api_base);
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        post_json_with_backoff(
            &self.client,
            &url,
            &payload,
            TRANSPORT_TIMEOUT,
            TRANSPORT_RETRIES,
            "telegram",
        )
        .await
    }
}

#[async_trait::async_trait]
impl Dispatcher for TelegramDispatcher {
    fn channel(&self) -> Channel {
        Channel::Chat
    }

    #[instrument(skip(self, ctx), fields(monitor_id = ctx.item.id))]
    async fn dispatch(&self, ctx: &AlertContext) -> DispatchOutcome {
        let Some((bot_token, chat_id)) = self.resolve_config(ctx.item.id).await else {
            return DispatchOutcome::Skipped("no telegram config (database or env)".to_string());
        };

        if let Err(blocked) = policy_gate(&self.policy, ctx).await {
            return blocked;
        }

        let state = self.registry.get(ctx.item.id).await;
        let throttle = Duration::from_secs(self.settings.telegram_throttle_seconds);

        match ctx.kind {
            AlertKind::Error => {
                // Long incidents on fast-cadence items space out to the
                // extended interval once the error streak passes the
                // threshold, whatever the basic throttle says.
                let extended =
                    Duration::from_secs(self.settings.extended_alert_interval_minutes * 60);
                if ctx.item.allow_repeat_alerts()
                    && self.settings.extended_alert_interval_minutes > 0
                    && ctx.item.effective_interval_secs() < 300
                    && ctx.consecutive_errors > self.settings.consecutive_error_threshold
                    && let Some(elapsed) = state.elapsed_since_sent(Channel::Chat).await
                    && elapsed < extended
                {
                    return DispatchOutcome::Skipped(format!(
                        "extended alert throttle active ({}s remaining)",
                        (extended - elapsed).as_secs()
                    ));
                }

                if !state
                    .can_send_alert(
                        Channel::Chat,
                        throttle,
                        ctx.item.allow_repeat_alerts(),
                        &self.curve,
                    )
                    .await
                {
                    return DispatchOutcome::Skipped("throttled".to_string());
                }

                match self.send(&bot_token, &chat_id, self.error_text(ctx)).await {
                    Ok(()) => {
                        state.mark_sent(Channel::Chat).await;
                        state.mark_error_sent(Channel::Chat).await;
                        DispatchOutcome::Sent
                    }
                    Err(e) => DispatchOutcome::Failed(e),
                }
            }
            AlertKind::Recovery => {
                // Chat recoveries go out unconditionally on the transition.
                match self.send(&bot_token, &chat_id, self.recovery_text(ctx)).await {
                    Ok(()) => {
                        state.mark_sent(Channel::Chat).await;
                        state.mark_recovery_sent(Channel::Chat).await;
                        DispatchOutcome::Sent
                    }
                    Err(e) => DispatchOutcome::Failed(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::schema::{AlertConfig, MonitorItem};
    use wiremock::matchers::{body_partial_json, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_item(id: i64) -> MonitorItem {
        MonitorItem {
            id,
            name: "api".to_string(),
            enable: true,
            url_check: "https://api.example.com".to_string(),
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

    fn dispatcher(store: Arc<MemoryStore>, api_base: &str) -> TelegramDispatcher {
        let registry = Arc::new(AlertRegistry::new());
        let policy = Arc::new(crate::policy::UserPolicy::new(store.clone()));
        let settings = Arc::new(Settings::from_env());
        TelegramDispatcher::new(
            reqwest::Client::new(),
            store,
            registry,
            policy,
            settings,
        )
        .with_api_base(api_base)
    }

    #[tokio::test]
    async fn test_skips_without_config() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(store, "http://unused.invalid");

        let ctx = AlertContext {
            item: test_item(1),
            kind: AlertKind::Error,
            message: "down".to_string(),
            consecutive_errors: 1,
            response_time_ms: None,
        };
        assert!(matches!(d.dispatch(&ctx).await, DispatchOutcome::Skipped(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_throttle_gates_long_incidents() {
        // allow_repeat item, 12 consecutive errors, alert sent recently:
        // the extended interval must keep the channel quiet even though
        // the basic 30s throttle has elapsed.
        let store = Arc::new(MemoryStore::new());
        store.insert_alert_config(
            1,
            AlertConfig {
                id: 10,
                name: Some("tg".to_string()),
                user_id: 0,
                alert_type: "telegram".to_string(),
                alert_config: Some("123:ABC,42".to_string()),
            },
        );
        // Unroutable endpoint: a send attempt would fail, a skip will not.
        let d = dispatcher(store, "http://127.0.0.1:9");

        let state = d.registry.get(1).await;
        for _ in 0..12 {
            state.increment_consecutive_error().await;
        }
        state.mark_sent(Channel::Chat).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let mut item = test_item(1);
        item.allow_alert_for_consecutive_error = Some(1);
        let ctx = AlertContext {
            item,
            kind: AlertKind::Error,
            message: "still down".to_string(),
            consecutive_errors: 12,
            response_time_ms: None,
        };
        let outcome = d.dispatch(&ctx).await;
        assert!(
            matches!(&outcome, DispatchOutcome::Skipped(reason) if reason.contains("extended")),
            "{outcome:?}"
        );
    }

    #[tokio::test]
    async fn test_sends_html_alert_with_db_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/bot123:ABC/sendMessage$"))
            .and(body_partial_json(serde_json::json!({"parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.insert_alert_config(
            1,
            AlertConfig {
                id: 10,
                name: Some("tg".to_string()),
                user_id: 0,
                alert_type: "telegram".to_string(),
                alert_config: Some("123:ABC,42".to_string()),
            },
        );

        let d = dispatcher(store, &server.uri());
        // First error of the episode passes the first-error-only throttle.
        d.registry.get(1).await.increment_consecutive_error().await;

        let ctx = AlertContext {
            item: test_item(1),
            kind: AlertKind::Error,
            message: "connect refused".to_string(),
            consecutive_errors: 1,
            response_time_ms: None,
        };
        assert_eq!(d.dispatch(&ctx).await, DispatchOutcome::Sent);
    }
}
