//! Push (FCM) dispatcher.
//!
//! Sends a notification plus a data map the mobile app uses to deep-link
//! into the monitor. The device token comes from the user's settings row;
//! the sender credential is an opaque string read from
//! `FIREBASE_SERVICE_ACCOUNT_PATH` and never logged in full.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::alerts::{AlertRegistry, Channel, ThrottleCurve};
use crate::config::Settings;
use crate::policy::PolicyHandle;
use crate::util::redact;

use super::{AlertContext, AlertKind, DispatchOutcome, Dispatcher, policy_gate};

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSPORT_RETRIES: u32 = 2;

pub struct PushDispatcher {
    client: reqwest::Client,
    registry: Arc<AlertRegistry>,
    policy: PolicyHandle,
    settings: Arc<Settings>,
    curve: ThrottleCurve,
    api_base: String,
}

impl PushDispatcher {
    pub fn new(
        client: reqwest::Client,
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
            registry,
            policy,
            settings,
            curve,
            api_base: "https://fcm.googleapis.com".to_string(),
        }
    }

    /// Point at a different FCM endpoint (proxies, staging).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Load the sender credential from the configured service-account file.
    ///
    /// The file either holds a JSON document with a `server_key` field or
    /// the bare key itself.
    async fn load_credential(&self) -> Option<String> {
        let path = &self.settings.firebase_service_account_path;
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("push credential not readable at {path}: {e}");
                return None;
            }
        };

        let key = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|doc| {
                doc.get("server_key")
                    .and_then(|k| k.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| raw.trim().to_string());

        if key.is_empty() {
            None
        } else {
            debug!("loaded push credential {}", redact(&key));
            Some(key)
        }
    }

    async fn send(
        &self,
        credential: &str,
        token: &str,
        title: String,
        body: String,
        event_type: &str,
        ctx: &AlertContext,
    ) -> Result<(), String> {
        let payload = json!({
            "to": token,
            "notification": { "title": title, "body": body },
            "data": {
                "monitor_id": ctx.item.id.to_string(),
                "url": ctx.item.url_check,
                "type": event_type,
                "timestamp": Utc::now().to_rfc3339(),
            },
        });

        let url = format!("{}/fcm/send", self.api_base);
        let mut last_error = String::new();

        for attempt in 0..=TRANSPORT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            let request = self
                .client
                .post(&url)
                .timeout(TRANSPORT_TIMEOUT)
                .header("Authorization", format!("key={credential}"))
                .json(&payload);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    last_error = format!("HTTP {status}");
                    if status.is_client_error() {
                        return Err(format!("client error, not retrying: {last_error}"));
                    }
                }
                Err(e) if e.is_timeout() => {
                    last_error = format!("timeout after {}s", TRANSPORT_TIMEOUT.as_secs());
                }
                Err(e) => {
                    last_error = format!("connection error: {e}");
                }
            }
        }

        Err(format!(
            "gave up after {} attempts: {last_error}",
            TRANSPORT_RETRIES + 1
        ))
    }
}

#[async_trait::async_trait]
impl Dispatcher for PushDispatcher {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    #[instrument(skip(self, ctx), fields(monitor_id = ctx.item.id))]
    async fn dispatch(&self, ctx: &AlertContext) -> DispatchOutcome {
        let Some(token) = self.policy.push_token(ctx.item.user_id).await else {
            return DispatchOutcome::Skipped(format!(
                "no push token for user {}",
                ctx.item.user_id
            ));
        };
        let Some(credential) = self.load_credential().await else {
            return DispatchOutcome::Skipped("no push credential configured".to_string());
        };

        if let Err(blocked) = policy_gate(&self.policy, ctx).await {
            return blocked;
        }

        let state = self.registry.get(ctx.item.id).await;

        match ctx.kind {
            AlertKind::Error => {
                let throttle = Duration::from_secs(self.settings.firebase_throttle_seconds);
                if !state
                    .can_send_alert(
                        Channel::Push,
                        throttle,
                        ctx.item.allow_repeat_alerts(),
                        &self.curve,
                    )
                    .await
                {
                    return DispatchOutcome::Skipped("throttled".to_string());
                }

                let title = format!("\u{1F534} {} is down", ctx.item.name);
                let body = format!("{} (Consecutive errors: {})", ctx.message, ctx.consecutive_errors);
                match self
                    .send(&credential, &token, title, body, "monitor_alert", ctx)
                    .await
                {
                    Ok(()) => {
                        state.mark_sent(Channel::Push).await;
                        state.mark_error_sent(Channel::Push).await;
                        DispatchOutcome::Sent
                    }
                    Err(e) => {
                        warn!(monitor_id = ctx.item.id, "push alert failed: {e}");
                        DispatchOutcome::Failed(e)
                    }
                }
            }
            AlertKind::Recovery => {
                // Push recoveries go out unconditionally on the transition.
                let title = format!("\u{2705} {} recovered", ctx.item.name);
                match self
                    .send(
                        &credential,
                        &token,
                        title,
                        ctx.message.clone(),
                        "monitor_recovery",
                        ctx,
                    )
                    .await
                {
                    Ok(()) => {
                        state.mark_sent(Channel::Push).await;
                        state.mark_recovery_sent(Channel::Push).await;
                        DispatchOutcome::Sent
                    }
                    Err(e) => DispatchOutcome::Failed(e),
                }
            }
        }
    }
}
