//! Webhook dispatcher.
//!
//! POSTs the JSON contract below to the operator's endpoint. Sending is
//! gated by BOTH the global `WEBHOOK_ENABLED` switch and the per-monitor
//! link — if either forbids, nothing goes out. Errors and recoveries are
//! sent once per failure episode, paired through the registry flags.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::alerts::{AlertRegistry, Channel, ThrottleCurve};
use crate::config::Settings;
use crate::policy::PolicyHandle;
use crate::storage::StoreHandle;
use crate::storage::schema::ChannelConfig;

use super::{
    AlertContext, AlertKind, DispatchOutcome, Dispatcher, policy_gate, post_json_with_backoff,
};

/// Wire payload; field names are a published contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub timestamp: String,
    pub alert_type: String,
    pub status: String,
    pub service: ServiceBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryBlock>,
    pub metadata: MetadataBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceBlock {
    pub name: String,
    pub url: String,
    pub monitor_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBlock {
    pub message: String,
    pub consecutive_count: u32,
    pub check_interval_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryBlock {
    pub message: String,
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataBlock {
    pub source: String,
    pub version: String,
    pub webhook_name: String,
}

impl WebhookPayload {
    pub fn for_error(ctx: &AlertContext, webhook_name: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            alert_type: "error".to_string(),
            status: "down".to_string(),
            service: ServiceBlock {
                name: ctx.item.name.clone(),
                url: ctx.item.url_check.clone(),
                monitor_id: ctx.item.id,
            },
            error: Some(ErrorBlock {
                message: format!("{} (Consecutive Error {})", ctx.message, ctx.consecutive_errors),
                consecutive_count: ctx.consecutive_errors,
                check_interval_seconds: ctx.item.effective_interval_secs() as i64,
            }),
            recovery: None,
            metadata: MetadataBlock {
                source: "monitor_service".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                webhook_name: webhook_name.to_string(),
            },
        }
    }

    pub fn for_recovery(ctx: &AlertContext, webhook_name: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            alert_type: "recovery".to_string(),
            status: "up".to_string(),
            service: ServiceBlock {
                name: ctx.item.name.clone(),
                url: ctx.item.url_check.clone(),
                monitor_id: ctx.item.id,
            },
            error: None,
            recovery: Some(RecoveryBlock {
                message: ctx.message.clone(),
                response_time_ms: ctx.response_time_ms.unwrap_or(0.0),
            }),
            metadata: MetadataBlock {
                source: "monitor_service".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                webhook_name: webhook_name.to_string(),
            },
        }
    }
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    store: StoreHandle,
    registry: Arc<AlertRegistry>,
    policy: PolicyHandle,
    settings: Arc<Settings>,
    curve: ThrottleCurve,
}

impl WebhookDispatcher {
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
        }
    }

    async fn resolve_config(&self, monitor_id: i64) -> Option<(String, String)> {
        match self.store.alert_config_for_item(monitor_id, "webhook").await {
            Ok(Some(config)) => match config.parse() {
                Some(ChannelConfig::Webhook { url, name }) => Some((url, name)),
                _ => {
                    debug!(monitor_id, "webhook config present but invalid");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(monitor_id, "webhook config lookup failed: {e}");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for WebhookDispatcher {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    #[instrument(skip(self, ctx), fields(monitor_id = ctx.item.id))]
    async fn dispatch(&self, ctx: &AlertContext) -> DispatchOutcome {
        // Global switch AND per-monitor link must both permit.
        if !self.settings.webhook_enabled {
            return DispatchOutcome::Skipped("webhooks disabled globally".to_string());
        }
        let Some((url, name)) = self.resolve_config(ctx.item.id).await else {
            return DispatchOutcome::Skipped("no webhook config".to_string());
        };

        if let Err(blocked) = policy_gate(&self.policy, ctx).await {
            return blocked;
        }

        let state = self.registry.get(ctx.item.id).await;
        let timeout = Duration::from_secs(self.settings.webhook_timeout);
        let retries = self.settings.webhook_max_retries;

        match ctx.kind {
            AlertKind::Error => {
                let throttle = Duration::from_secs(self.settings.webhook_throttle_seconds);
                if !state
                    .can_send_alert(
                        Channel::Webhook,
                        throttle,
                        ctx.item.allow_repeat_alerts(),
                        &self.curve,
                    )
                    .await
                {
                    return DispatchOutcome::Skipped("throttled".to_string());
                }

                let payload = serde_json::to_value(WebhookPayload::for_error(ctx, &name))
                    .expect("webhook payload serializes");
                match post_json_with_backoff(&self.client, &url, &payload, timeout, retries, "webhook")
                    .await
                {
                    Ok(()) => {
                        state.mark_sent(Channel::Webhook).await;
                        state.mark_error_sent(Channel::Webhook).await;
                        DispatchOutcome::Sent
                    }
                    Err(e) => DispatchOutcome::Failed(e),
                }
            }
            AlertKind::Recovery => {
                // Recoveries balance error notices one-for-one.
                if !state.should_send_recovery(Channel::Webhook).await {
                    return DispatchOutcome::Skipped(
                        "no unbalanced error for this episode".to_string(),
                    );
                }

                let payload = serde_json::to_value(WebhookPayload::for_recovery(ctx, &name))
                    .expect("webhook payload serializes");
                match post_json_with_backoff(&self.client, &url, &payload, timeout, retries, "webhook")
                    .await
                {
                    Ok(()) => {
                        state.mark_sent(Channel::Webhook).await;
                        state.mark_recovery_sent(Channel::Webhook).await;
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
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method};
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

    fn error_ctx(count: u32) -> AlertContext {
        AlertContext {
            item: test_item(1),
            kind: AlertKind::Error,
            message: "connect refused".to_string(),
            consecutive_errors: count,
            response_time_ms: None,
        }
    }

    fn seeded_dispatcher(store: Arc<MemoryStore>, url: &str) -> WebhookDispatcher {
        store.insert_alert_config(
            1,
            AlertConfig {
                id: 20,
                name: Some("ops hook".to_string()),
                user_id: 0,
                alert_type: "webhook".to_string(),
                alert_config: Some(url.to_string()),
            },
        );
        let registry = Arc::new(AlertRegistry::new());
        let policy = Arc::new(crate::policy::UserPolicy::new(store.clone()));
        WebhookDispatcher::new(
            reqwest::Client::new(),
            store,
            registry,
            policy,
            Arc::new(Settings::from_env()),
        )
    }

    #[test]
    fn test_payload_round_trips_through_json() {
        let payload = WebhookPayload::for_error(&error_ctx(3), "ops hook");
        let json = serde_json::to_string(&payload).unwrap();
        let back: WebhookPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, back);
        assert_eq!(back.alert_type, "error");
        assert_eq!(back.status, "down");
        assert_eq!(back.error.as_ref().unwrap().consecutive_count, 3);
        assert!(back.recovery.is_none());
    }

    #[tokio::test]
    async fn test_error_then_recovery_pairing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let d = seeded_dispatcher(store, &server.uri());

        // Recovery before any error is skipped.
        let recovery = AlertContext {
            kind: AlertKind::Recovery,
            message: "back online".to_string(),
            consecutive_errors: 0,
            response_time_ms: Some(42.0),
            ..error_ctx(0)
        };
        assert!(matches!(
            d.dispatch(&recovery).await,
            DispatchOutcome::Skipped(_)
        ));

        // First error sends; second consecutive error is suppressed.
        d.registry.get(1).await.increment_consecutive_error().await;
        assert_eq!(d.dispatch(&error_ctx(1)).await, DispatchOutcome::Sent);
        d.registry.get(1).await.increment_consecutive_error().await;
        assert!(matches!(
            d.dispatch(&error_ctx(2)).await,
            DispatchOutcome::Skipped(_)
        ));

        // Now the recovery balances the episode, exactly once.
        d.registry.get(1).await.reset_consecutive_error().await;
        assert_eq!(d.dispatch(&recovery).await, DispatchOutcome::Sent);
        assert!(matches!(
            d.dispatch(&recovery).await,
            DispatchOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_global_switch_forbids_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"alert_type": "error"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let mut d = seeded_dispatcher(store, &server.uri());
        let mut settings = Settings::from_env();
        settings.webhook_enabled = false;
        d.settings = Arc::new(settings);

        d.registry.get(1).await.increment_consecutive_error().await;
        assert!(matches!(
            d.dispatch(&error_ctx(1)).await,
            DispatchOutcome::Skipped(_)
        ));
    }
}
