//! Probe library.
//!
//! Stateless check functions, one per monitor type, all returning the
//! uniform [`ProbeResult`] shape. Every probe runs through the shared retry
//! wrapper: up to `1 + MAX_RETRIES` attempts with a fixed delay in between,
//! where transport errors, timeouts *and* validation failures all count as
//! retryable. Config errors (e.g. an unparseable port) abort immediately.

pub mod http;
pub mod icmp;
pub mod tcp;
pub mod tls;

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::storage::schema::{CheckKind, MonitorItem};

/// Extra attempts after the first failed one.
pub const MAX_RETRIES: u32 = 2;

/// Sleep between attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Failure classification carried in `details.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TransportTimeout,
    TransportRefused,
    TransportOther,
    ValidationMissingKeyword,
    ValidationForbiddenKeyword,
    HttpStatus,
    Tls,
    TlsExpiringSoon,
    ConfigInvalid,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportTimeout => "transport_timeout",
            Self::TransportRefused => "transport_refused",
            Self::TransportOther => "transport_other",
            Self::ValidationMissingKeyword => "validation_missing_keyword",
            Self::ValidationForbiddenKeyword => "validation_forbidden_keyword",
            Self::HttpStatus => "http_status",
            Self::Tls => "tls",
            Self::TlsExpiringSoon => "tls_expiring_soon",
            Self::ConfigInvalid => "config_invalid",
        }
    }
}

/// Uniform probe outcome.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    /// Milliseconds; `None` only when no attempt could be measured.
    pub response_time_ms: Option<f64>,
    /// Short human diagnostic.
    pub message: String,
    /// Type-specific details, including retry bookkeeping.
    pub details: Map<String, Value>,
}

impl ProbeResult {
    pub fn ok(message: impl Into<String>, response_time_ms: Option<f64>) -> Self {
        Self {
            success: true,
            response_time_ms,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn fail(
        kind: FailureKind,
        message: impl Into<String>,
        response_time_ms: Option<f64>,
    ) -> Self {
        let mut details = Map::new();
        details.insert("kind".to_string(), json!(kind.as_str()));
        Self {
            success: false,
            response_time_ms,
            message: message.into(),
            details,
        }
    }

    pub fn detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn failure_kind(&self) -> Option<&str> {
        self.details.get("kind").and_then(Value::as_str)
    }
}

/// One attempt's verdict inside the retry wrapper.
pub enum Attempt {
    /// Positive result; terminates the retry loop.
    Success(ProbeResult),
    /// Failed, worth retrying.
    Retry(ProbeResult),
    /// Failed terminally (config or logic error); no retry.
    Abort(ProbeResult),
}

/// Drive `attempt` up to `1 + MAX_RETRIES` times with `RETRY_DELAY` between
/// tries, stamping `retry_attempts` / `retry_messages` into the result.
pub(crate) async fn run_with_retries<F, Fut>(label: &str, mut attempt: F) -> ProbeResult
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut retry_messages: Vec<String> = Vec::new();

    for n in 0..=MAX_RETRIES {
        if n > 0 {
            debug!("[{label}] retry attempt {}/{}", n + 1, MAX_RETRIES + 1);
        }

        match attempt(n).await {
            Attempt::Success(mut result) => {
                if n > 0 {
                    result.message = format!("{} (succeeded after {n} retries)", result.message);
                }
                result
                    .details
                    .insert("retry_attempts".to_string(), json!(n));
                if !retry_messages.is_empty() {
                    result
                        .details
                        .insert("retry_messages".to_string(), json!(retry_messages));
                }
                return result;
            }
            Attempt::Abort(mut result) => {
                result
                    .details
                    .insert("retry_attempts".to_string(), json!(n));
                if !retry_messages.is_empty() {
                    result
                        .details
                        .insert("retry_messages".to_string(), json!(retry_messages));
                }
                return result;
            }
            Attempt::Retry(mut result) => {
                retry_messages.push(format!("Attempt {}: {}", n + 1, result.message));
                if n < MAX_RETRIES {
                    debug!("[{label}] attempt {} failed: {}", n + 1, result.message);
                    tokio::time::sleep(RETRY_DELAY).await;
                } else {
                    result.message = format!("{} (after {MAX_RETRIES} retries)", result.message);
                    result
                        .details
                        .insert("retry_attempts".to_string(), json!(MAX_RETRIES));
                    result
                        .details
                        .insert("retry_messages".to_string(), json!(retry_messages));
                    return result;
                }
            }
        }
    }

    unreachable!("retry loop always returns")
}

/// Dispatch one probe by item type.
pub async fn run_check(item: &MonitorItem, http: &reqwest::Client) -> ProbeResult {
    match item.kind() {
        Some(CheckKind::PingWeb) => http::ping_web(item, http).await,
        Some(CheckKind::WebContent) => http::check_web_content(item, http).await,
        Some(CheckKind::PingIcmp) => icmp::ping_icmp(item).await,
        Some(CheckKind::Tcp) => tcp::check_tcp_port(item).await,
        Some(CheckKind::TcpClosed) => tcp::check_tcp_port_closed(item).await,
        Some(CheckKind::SslExpiry) => tls::check_certificate(item).await,
        None => ProbeResult::fail(
            FailureKind::ConfigInvalid,
            format!("Unknown monitor type: {}", item.check_type),
            None,
        )
        .detail("retry_attempts", json!(0)),
    }
}

/// Extract the bare hostname from a URL-ish check target (scheme, port and
/// path stripped).
pub(crate) fn hostname_of(target: &str) -> String {
    let target = target.trim();
    let without_scheme = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    let without_path = without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme);
    without_path
        .rsplit_once(':')
        .map(|(host, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() {
                host
            } else {
                without_path
            }
        })
        .unwrap_or(without_path)
        .to_string()
}

/// Normalize a web target to a full URL (https when no scheme is given).
pub(crate) fn normalize_url(target: &str) -> String {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("https://{target}")
    }
}
