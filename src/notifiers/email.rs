//! Email (SMTP) dispatcher.
//!
//! Multipart HTML + plain-text mail through a pool of SMTP accounts; each
//! send picks one at random to spread volume and avoid provider flagging.
//! Email is the most conservative channel: always first-error-only, with a
//! long time throttle on top, regardless of the item's repeat-alert flag.

use std::sync::Arc;
use std::time::Duration;

use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rand::seq::SliceRandom;
use tracing::{debug, instrument, warn};

use crate::alerts::{AlertRegistry, Channel};
use crate::config::{Settings, SmtpAccount};
use crate::policy::PolicyHandle;
use crate::storage::StoreHandle;
use crate::storage::schema::ChannelConfig;
use crate::util::{admin_edit_url, redact};

use super::{AlertContext, AlertKind, DispatchOutcome, Dispatcher, policy_gate};

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(15);

/// SMTP passwords arrive as opaque strings from the deployment secret
/// store; this is the seam where a real decryption step would live.
fn resolve_secret(raw: &str) -> String {
    raw.trim().to_string()
}

pub struct EmailDispatcher {
    store: StoreHandle,
    registry: Arc<AlertRegistry>,
    policy: PolicyHandle,
    settings: Arc<Settings>,
}

impl EmailDispatcher {
    pub fn new(
        store: StoreHandle,
        registry: Arc<AlertRegistry>,
        policy: PolicyHandle,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            settings,
        }
    }

    /// Per-item email config first, the user's account email second.
    async fn resolve_recipient(&self, ctx: &AlertContext) -> Option<String> {
        match self.store.alert_config_for_item(ctx.item.id, "email").await {
            Ok(Some(config)) => {
                if let Some(ChannelConfig::Email { to }) = config.parse() {
                    return Some(to);
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(monitor_id = ctx.item.id, "email config lookup failed: {e}");
            }
        }
        self.policy.email(ctx.item.user_id).await
    }

    fn bodies(&self, ctx: &AlertContext) -> (String, String, String) {
        let admin_url = admin_edit_url(&self.settings.admin_domain, ctx.item.id);
        match ctx.kind {
            AlertKind::Error => {
                let subject = format!("\u{1F534} Monitor Alert: {}", ctx.item.name);
                let plain = format!(
                    "Service: {}\nURL: {}\nError: {} (Consecutive errors: {})\n\nManage: {admin_url}\n",
                    ctx.item.name, ctx.item.url_check, ctx.message, ctx.consecutive_errors
                );
                let html = format!(
                    "<h2 style=\"color:#c0392b\">Service Alert</h2>\
                     <p><b>Service:</b> {}</p>\
                     <p><b>URL:</b> {}</p>\
                     <p><b>Error:</b> {} (Consecutive errors: {})</p>\
                     <p><a href=\"{admin_url}\">Manage monitor</a></p>",
                    ctx.item.name, ctx.item.url_check, ctx.message, ctx.consecutive_errors
                );
                (subject, plain, html)
            }
            AlertKind::Recovery => {
                let subject = format!("\u{2705} Monitor Recovery: {}", ctx.item.name);
                let plain = format!(
                    "Service: {}\nURL: {}\nStatus: {}\n\nManage: {admin_url}\n",
                    ctx.item.name, ctx.item.url_check, ctx.message
                );
                let html = format!(
                    "<h2 style=\"color:#27ae60\">Service Recovered</h2>\
                     <p><b>Service:</b> {}</p>\
                     <p><b>URL:</b> {}</p>\
                     <p><b>Status:</b> {}</p>\
                     <p><a href=\"{admin_url}\">Manage monitor</a></p>",
                    ctx.item.name, ctx.item.url_check, ctx.message
                );
                (subject, plain, html)
            }
        }
    }

    fn pick_account(&self) -> Option<&SmtpAccount> {
        self.settings.smtp.accounts.choose(&mut rand::thread_rng())
    }

    async fn send(&self, to: &str, ctx: &AlertContext) -> Result<(), String> {
        let Some(account) = self.pick_account() else {
            return Err("no SMTP accounts configured".to_string());
        };
        let smtp = &self.settings.smtp;

        let from: Mailbox = format!("{} <{}>", smtp.from_name, account.email)
            .parse()
            .map_err(|e| format!("invalid sender address: {e}"))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| format!("invalid recipient address: {e}"))?;

        let (subject, plain, html) = self.bodies(ctx);
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(plain, html))
            .map_err(|e| format!("failed to build message: {e}"))?;

        let credentials = Credentials::new(
            account.email.clone(),
            resolve_secret(&account.password),
        );
        let builder = if smtp.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                .map_err(|e| format!("SMTP relay setup failed: {e}"))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        };
        let transport = builder
            .port(smtp.port)
            .credentials(credentials)
            .timeout(Some(TRANSPORT_TIMEOUT))
            .build();

        debug!(
            "sending mail via account {} ({})",
            account.email,
            redact(&account.password)
        );
        transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| format!("SMTP send failed: {e}"))
    }
}

#[async_trait::async_trait]
impl Dispatcher for EmailDispatcher {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    #[instrument(skip(self, ctx), fields(monitor_id = ctx.item.id))]
    async fn dispatch(&self, ctx: &AlertContext) -> DispatchOutcome {
        if !self.settings.smtp.enabled {
            return DispatchOutcome::Skipped("SMTP disabled".to_string());
        }
        let Some(to) = self.resolve_recipient(ctx).await else {
            return DispatchOutcome::Skipped(format!(
                "no email target for user {}",
                ctx.item.user_id
            ));
        };

        if let Err(blocked) = policy_gate(&self.policy, ctx).await {
            return blocked;
        }

        let state = self.registry.get(ctx.item.id).await;
        let throttle = Duration::from_secs(self.settings.email_throttle_seconds);

        match ctx.kind {
            AlertKind::Error => {
                // Always first-error-only: the per-item repeat flag is
                // deliberately ignored for email.
                if ctx.consecutive_errors > 1 {
                    return DispatchOutcome::Skipped(format!(
                        "consecutive error #{}, email only sends the first",
                        ctx.consecutive_errors
                    ));
                }
                // And a long time throttle on top, against flapping items
                // opening a new episode every probe.
                if let Some(elapsed) = state.elapsed_since_sent(Channel::Email).await
                    && elapsed < throttle
                {
                    return DispatchOutcome::Skipped(format!(
                        "time throttle: {}s remaining",
                        (throttle - elapsed).as_secs()
                    ));
                }

                match self.send(&to, ctx).await {
                    Ok(()) => {
                        state.mark_sent(Channel::Email).await;
                        state.mark_error_sent(Channel::Email).await;
                        DispatchOutcome::Sent
                    }
                    Err(e) => {
                        warn!(monitor_id = ctx.item.id, "email alert failed: {e}");
                        DispatchOutcome::Failed(e)
                    }
                }
            }
            AlertKind::Recovery => {
                // Recoveries balance error mails one-for-one.
                if !state.should_send_recovery(Channel::Email).await {
                    return DispatchOutcome::Skipped(
                        "no unbalanced error for this episode".to_string(),
                    );
                }

                match self.send(&to, ctx).await {
                    Ok(()) => {
                        state.mark_sent(Channel::Email).await;
                        state.mark_recovery_sent(Channel::Email).await;
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
    use crate::storage::schema::MonitorItem;

    fn test_item() -> MonitorItem {
        MonitorItem {
            id: 1,
            name: "api".to_string(),
            enable: true,
            url_check: "https://api.example.com".to_string(),
            check_type: "ping_web".to_string(),
            check_interval_seconds: Some(60),
            user_id: 5,
            last_check_status: None,
            count_online: 0,
            count_offline: 0,
            last_check_time: None,
            result_valid: None,
            result_error: None,
            max_alert_count: None,
            stop_to: None,
            force_restart: false,
            allow_alert_for_consecutive_error: Some(1),
            deleted_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn dispatcher(settings: Settings) -> EmailDispatcher {
        let store = Arc::new(MemoryStore::new());
        store.insert_email(5, "ops@example.com");
        let policy = Arc::new(crate::policy::UserPolicy::new(store.clone()));
        EmailDispatcher::new(
            store,
            Arc::new(AlertRegistry::new()),
            policy,
            Arc::new(settings),
        )
    }

    #[tokio::test]
    async fn test_disabled_smtp_skips() {
        let mut settings = Settings::from_env();
        settings.smtp.enabled = false;
        let d = dispatcher(settings);

        let ctx = AlertContext {
            item: test_item(),
            kind: AlertKind::Error,
            message: "down".to_string(),
            consecutive_errors: 1,
            response_time_ms: None,
        };
        assert!(matches!(d.dispatch(&ctx).await, DispatchOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_repeat_errors_skipped_even_with_allow_repeat() {
        let mut settings = Settings::from_env();
        settings.smtp.enabled = true;
        settings.smtp.accounts = vec![SmtpAccount {
            email: "alerts@example.com".to_string(),
            password: "secret".to_string(),
        }];
        let d = dispatcher(settings);

        // Item has allow_repeat set, but email stays first-error-only.
        let ctx = AlertContext {
            item: test_item(),
            kind: AlertKind::Error,
            message: "down".to_string(),
            consecutive_errors: 2,
            response_time_ms: None,
        };
        let outcome = d.dispatch(&ctx).await;
        assert!(
            matches!(&outcome, DispatchOutcome::Skipped(reason) if reason.contains("first")),
            "{outcome:?}"
        );
    }

    #[tokio::test]
    async fn test_recovery_requires_prior_error() {
        let mut settings = Settings::from_env();
        settings.smtp.enabled = true;
        settings.smtp.accounts = vec![SmtpAccount {
            email: "alerts@example.com".to_string(),
            password: "secret".to_string(),
        }];
        let d = dispatcher(settings);

        let ctx = AlertContext {
            item: test_item(),
            kind: AlertKind::Recovery,
            message: "back online".to_string(),
            consecutive_errors: 0,
            response_time_ms: Some(12.0),
        };
        assert!(matches!(d.dispatch(&ctx).await, DispatchOutcome::Skipped(_)));
    }

    #[test]
    fn test_resolve_secret_is_opaque_passthrough() {
        assert_eq!(resolve_secret("  s3cret  "), "s3cret");
    }
}
