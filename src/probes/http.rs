//! HTTP probes: `ping_web` and `web_content`.

use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, instrument};

use crate::storage::schema::{MonitorItem, split_keywords};

use super::{Attempt, FailureKind, ProbeResult, normalize_url, run_with_retries};

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read at most this much of the response body.
const MAX_BODY_BYTES: usize = 10 * 1024;

/// How much body to echo into the logs for diagnostics.
const PREVIEW_CHARS: usize = 50;

struct FetchedPage {
    status: u16,
    reason: String,
    body: String,
    final_url: String,
    response_time_ms: f64,
}

enum FetchError {
    Timeout(f64),
    Transport { kind: FailureKind, message: String, response_time_ms: f64 },
}

async fn fetch_limited(client: &reqwest::Client, url: &str) -> Result<FetchedPage, FetchError> {
    let start = Instant::now();
    let elapsed_ms = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;

    let mut response = match client.get(url).timeout(ATTEMPT_TIMEOUT).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return Err(FetchError::Timeout(elapsed_ms(start))),
        Err(e) => {
            let kind = if e.is_connect() {
                FailureKind::TransportRefused
            } else {
                FailureKind::TransportOther
            };
            return Err(FetchError::Transport {
                kind,
                message: format!("HTTP client error: {e}"),
                response_time_ms: elapsed_ms(start),
            });
        }
    };

    let status = response.status();
    let final_url = response.url().to_string();

    // Read the body in chunks, capped at 10 KiB.
    let mut body = Vec::with_capacity(1024);
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = MAX_BODY_BYTES - body.len();
                if chunk.len() >= remaining {
                    body.extend_from_slice(&chunk[..remaining]);
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            // A body that dies mid-read still gives us the status line.
            Err(_) => break,
        }
    }

    Ok(FetchedPage {
        status: status.as_u16(),
        reason: status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
        final_url,
        response_time_ms: elapsed_ms(start),
    })
}

fn log_preview(context: &str, url: &str, body: &str, monitor_id: i64) {
    let preview: String = body
        .chars()
        .take(PREVIEW_CHARS)
        .collect::<String>()
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    debug!(
        monitor_id,
        "[{context}] {url} - preview ({PREVIEW_CHARS} chars): {preview} | size: {} bytes",
        body.len()
    );
}

fn transport_attempt(err: FetchError, url: &str) -> Attempt {
    match err {
        FetchError::Timeout(rt) => Attempt::Retry(
            ProbeResult::fail(
                FailureKind::TransportTimeout,
                format!("HTTP request timeout to {url}"),
                Some(rt),
            )
            .detail("timeout", json!(true))
            .detail("url", json!(url)),
        ),
        FetchError::Transport { kind, message, response_time_ms } => Attempt::Retry(
            ProbeResult::fail(kind, message, Some(response_time_ms)).detail("url", json!(url)),
        ),
    }
}

/// HTTP GET with redirects; success is any final status below 400.
#[instrument(skip(client), fields(monitor_id = item.id))]
pub async fn ping_web(item: &MonitorItem, client: &reqwest::Client) -> ProbeResult {
    let url = normalize_url(&item.url_check);
    let monitor_id = item.id;

    run_with_retries("ping_web", |_| {
        let url = url.clone();
        async move {
            let page = match fetch_limited(client, &url).await {
                Ok(page) => page,
                Err(err) => return transport_attempt(err, &url),
            };

            log_preview("WEB", &url, &page.body, monitor_id);

            let result = ProbeResult {
                success: page.status < 400,
                response_time_ms: Some(page.response_time_ms),
                message: format!("HTTP {} - {}", page.status, page.reason),
                details: serde_json::Map::new(),
            }
            .detail("status_code", json!(page.status))
            .detail("content_length", json!(page.body.len()))
            .detail("url", json!(page.final_url));

            if page.status < 400 {
                Attempt::Success(result)
            } else {
                let mut result = result;
                result
                    .details
                    .insert("kind".to_string(), json!(FailureKind::HttpStatus.as_str()));
                Attempt::Retry(result)
            }
        }
    })
    .await
}

/// HTTP GET plus keyword validation: forbidden keywords first, then the
/// required set (all must appear).
#[instrument(skip(client), fields(monitor_id = item.id))]
pub async fn check_web_content(item: &MonitorItem, client: &reqwest::Client) -> ProbeResult {
    let url = normalize_url(&item.url_check);
    let monitor_id = item.id;
    let error_keywords = split_keywords(item.result_error.as_deref());
    let valid_keywords = split_keywords(item.result_valid.as_deref());

    run_with_retries("web_content", |_| {
        let url = url.clone();
        let error_keywords = error_keywords.clone();
        let valid_keywords = valid_keywords.clone();
        async move {
            let page = match fetch_limited(client, &url).await {
                Ok(page) => page,
                Err(err) => return transport_attempt(err, &url),
            };

            log_preview("CONTENT", &url, &page.body, monitor_id);

            if page.status >= 400 {
                return Attempt::Retry(
                    ProbeResult::fail(
                        FailureKind::HttpStatus,
                        format!("HTTP {} - Cannot check content", page.status),
                        Some(page.response_time_ms),
                    )
                    .detail("status_code", json!(page.status))
                    .detail("url", json!(page.final_url)),
                );
            }

            // Forbidden keywords take precedence over the required set.
            if let Some(keyword) = error_keywords.iter().find(|k| page.body.contains(k.as_str())) {
                return Attempt::Retry(
                    ProbeResult::fail(
                        FailureKind::ValidationForbiddenKeyword,
                        format!("Found error keyword: \"{keyword}\""),
                        Some(page.response_time_ms),
                    )
                    .detail("status_code", json!(page.status))
                    .detail("content_length", json!(page.body.len()))
                    .detail("error_keyword", json!(keyword))
                    .detail("check_type", json!("error_keyword"))
                    .detail("url", json!(page.final_url)),
                );
            }

            let missing: Vec<&String> = valid_keywords
                .iter()
                .filter(|k| !page.body.contains(k.as_str()))
                .collect();
            if !missing.is_empty() {
                let listed = missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Attempt::Retry(
                    ProbeResult::fail(
                        FailureKind::ValidationMissingKeyword,
                        format!("Missing required keywords: {listed}"),
                        Some(page.response_time_ms),
                    )
                    .detail("status_code", json!(page.status))
                    .detail("content_length", json!(page.body.len()))
                    .detail("missing_keywords", json!(missing))
                    .detail("check_type", json!("missing_required"))
                    .detail("url", json!(page.final_url)),
                );
            }

            let message = if valid_keywords.is_empty() {
                format!("Content validation passed (Status: {})", page.status)
            } else {
                format!("All required keywords found (Status: {})", page.status)
            };
            Attempt::Success(
                ProbeResult::ok(message, Some(page.response_time_ms))
                    .detail("status_code", json!(page.status))
                    .detail("content_length", json!(page.body.len()))
                    .detail("check_type", json!("content_validation"))
                    .detail("url", json!(page.final_url)),
            )
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item_with(url: &str, valid: Option<&str>, error: Option<&str>) -> MonitorItem {
        MonitorItem {
            id: 1,
            name: "content".to_string(),
            enable: true,
            url_check: url.to_string(),
            check_type: "web_content".to_string(),
            check_interval_seconds: Some(60),
            user_id: 0,
            last_check_status: None,
            count_online: 0,
            count_offline: 0,
            last_check_time: None,
            result_valid: valid.map(str::to_string),
            result_error: error.map(str::to_string),
            max_alert_count: None,
            stop_to: None,
            force_restart: false,
            allow_alert_for_consecutive_error: None,
            deleted_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_ping_web_success_below_400() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let item = item_with(&server.uri(), None, None);
        let result = ping_web(&item, &reqwest::Client::new()).await;

        assert!(result.success);
        assert_eq!(result.details["status_code"], 200);
        assert_eq!(result.details["retry_attempts"], 0);
        assert!(result.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_web_content_all_keywords_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Service is healthy and OK"))
            .mount(&server)
            .await;

        let item = item_with(&server.uri(), Some("OK,healthy"), Some("maintenance"));
        let result = check_web_content(&item, &reqwest::Client::new()).await;

        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn test_web_content_forbidden_keyword_beats_valid() {
        // "OK" is present, but the forbidden keyword wins.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK but under maintenance"))
            .mount(&server)
            .await;

        let item = item_with(&server.uri(), Some("OK,healthy"), Some("maintenance"));
        let result = check_web_content(&item, &reqwest::Client::new()).await;

        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some("validation_forbidden_keyword"));
        assert_eq!(result.details["error_keyword"], "maintenance");
    }

    #[tokio::test]
    async fn test_web_content_reports_missing_keywords() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Service is healthy"))
            .mount(&server)
            .await;

        let item = item_with(&server.uri(), Some("OK,healthy"), None);
        let result = check_web_content(&item, &reqwest::Client::new()).await;

        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some("validation_missing_keyword"));
        assert_eq!(result.details["missing_keywords"], serde_json::json!(["OK"]));
    }
}
