//! Notification dispatchers.
//!
//! One dispatcher per channel behind the [`Dispatcher`] trait, plus the
//! [`Notifier`] front door that the monitor loop calls with every probe
//! outcome. The front door owns the consecutive-error counter transition
//! (incremented exactly once per failed probe, before any per-channel
//! throttle check; reset once on success) and decides which transitions
//! notify at all. Dispatchers then apply their own config lookup, user
//! policy gate, throttle and transport.

pub mod email;
pub mod push;
pub mod telegram;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::alerts::{AlertRegistry, Channel};
use crate::policy::UserPolicy;
use crate::probes::ProbeResult;
use crate::storage::schema::MonitorItem;

/// What happened on one probe, from the alerting point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Error,
    Recovery,
}

/// Everything a dispatcher needs to compose and send one notification.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub item: MonitorItem,
    pub kind: AlertKind,
    /// Probe diagnostic (error message, or recovery summary).
    pub message: String,
    /// Counter value after this probe's transition.
    pub consecutive_errors: u32,
    pub response_time_ms: Option<f64>,
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Deliberately not sent (no config, policy denied, throttled, ...).
    Skipped(String),
    /// Transport gave up after its retry budget.
    Failed(String),
}

/// A notification channel implementation.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn channel(&self) -> Channel;

    async fn dispatch(&self, ctx: &AlertContext) -> DispatchOutcome;
}

/// Front door: translates probe outcomes into channel fan-out.
pub struct Notifier {
    registry: Arc<AlertRegistry>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
}

impl Notifier {
    pub fn new(registry: Arc<AlertRegistry>, dispatchers: Vec<Arc<dyn Dispatcher>>) -> Self {
        Self {
            registry,
            dispatchers,
        }
    }

    /// Apply the state-transition rules for one persisted probe outcome.
    ///
    /// `previous_status` is the status that was persisted *before* this
    /// probe; the caller guarantees the new status is already durable.
    pub async fn handle_probe_outcome(
        &self,
        item: &MonitorItem,
        previous_status: Option<i32>,
        result: &ProbeResult,
    ) {
        let state = self.registry.get(item.id).await;

        if result.success {
            let previous_errors = state.reset_consecutive_error().await;
            if previous_errors > 0 {
                info!(
                    monitor_id = item.id,
                    "service recovered, reset consecutive error count (was: {previous_errors})"
                );
            }

            // Recovery is only meaningful after a persisted failure.
            if previous_status == Some(-1) {
                let mut message = format!("Service '{}' is back online", item.name);
                if let Some(rt) = result.response_time_ms {
                    message.push_str(&format!(" (Response time: {rt:.0}ms)"));
                }
                self.fan_out(AlertContext {
                    item: item.clone(),
                    kind: AlertKind::Recovery,
                    message,
                    consecutive_errors: 0,
                    response_time_ms: result.response_time_ms,
                })
                .await;
            }
        } else {
            let count = state.increment_consecutive_error().await;
            debug!(monitor_id = item.id, "consecutive errors: {count}");

            self.fan_out(AlertContext {
                item: item.clone(),
                kind: AlertKind::Error,
                message: result.message.clone(),
                consecutive_errors: count,
                response_time_ms: result.response_time_ms,
            })
            .await;
        }
    }

    async fn fan_out(&self, ctx: AlertContext) {
        let results = join_all(self.dispatchers.iter().map(|dispatcher| {
            let ctx = &ctx;
            async move { (dispatcher.channel(), dispatcher.dispatch(ctx).await) }
        }))
        .await;

        for (channel, outcome) in results {
            match outcome {
                DispatchOutcome::Sent => {
                    info!(
                        monitor_id = ctx.item.id,
                        channel = channel.as_str(),
                        "notification sent ({:?})",
                        ctx.kind
                    );
                }
                DispatchOutcome::Skipped(reason) => {
                    debug!(
                        monitor_id = ctx.item.id,
                        channel = channel.as_str(),
                        "notification skipped: {reason}"
                    );
                }
                DispatchOutcome::Failed(reason) => {
                    warn!(
                        monitor_id = ctx.item.id,
                        channel = channel.as_str(),
                        "notification failed: {reason}"
                    );
                }
            }
        }
    }
}

/// Shared user-policy gate.
///
/// Error alerts honor the user's alert window and global mute; recoveries
/// bypass the gate on every channel (the episode flags flip exactly once
/// per transition, so a gated recovery would be lost forever).
pub(crate) async fn policy_gate(
    policy: &UserPolicy,
    ctx: &AlertContext,
) -> Result<(), DispatchOutcome> {
    match ctx.kind {
        AlertKind::Recovery => {
            debug!(
                monitor_id = ctx.item.id,
                "recovery notification bypasses the user alert window"
            );
            Ok(())
        }
        AlertKind::Error => {
            let (allowed, reason) = policy.is_alert_time_allowed(ctx.item.user_id).await;
            if allowed {
                Ok(())
            } else {
                Err(DispatchOutcome::Skipped(format!(
                    "blocked for user {}: {reason}",
                    ctx.item.user_id
                )))
            }
        }
    }
}

/// POST a JSON payload with bounded timeout and exponential backoff.
///
/// `max_retries` extra attempts with 1 s/2 s/4 s waits; 4xx responses are
/// never retried (the payload will not get better).
pub(crate) async fn post_json_with_backoff(
    client: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
    timeout: Duration,
    max_retries: u32,
    label: &str,
) -> Result<(), String> {
    let mut last_error = String::new();

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let wait = Duration::from_secs(1 << (attempt - 1));
            debug!("[{label}] retry attempt {attempt} after {}s", wait.as_secs());
            tokio::time::sleep(wait).await;
        }

        match client.post(url).timeout(timeout).json(payload).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!("[{label}] delivered (status: {status}, attempt: {})", attempt + 1);
                    return Ok(());
                }
                let body = response.text().await.unwrap_or_default();
                last_error = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
                if status.is_client_error() {
                    return Err(format!("client error, not retrying: {last_error}"));
                }
            }
            Err(e) if e.is_timeout() => {
                last_error = format!("timeout after {}s", timeout.as_secs());
            }
            Err(e) => {
                last_error = format!("connection error: {e}");
            }
        }
    }

    Err(format!(
        "gave up after {} attempts: {last_error}",
        max_retries + 1
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_backoff_succeeds_first_try() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = post_json_with_backoff(
            &client,
            &format!("{}/hook", server.uri()),
            &json!({"ok": true}),
            Duration::from_secs(5),
            2,
            "test",
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_post_backoff_does_not_retry_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = post_json_with_backoff(
            &client,
            &server.uri(),
            &json!({}),
            Duration::from_secs(5),
            3,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("not retrying"));
    }

    #[tokio::test]
    async fn test_post_backoff_retries_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = post_json_with_backoff(
            &client,
            &server.uri(),
            &json!({}),
            Duration::from_secs(5),
            2,
            "test",
        )
        .await;
        assert!(result.is_err());
    }
}
