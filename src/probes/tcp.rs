//! TCP connect probes, including the inverted "port must be closed" variant.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::net::TcpStream;
use tracing::instrument;

use crate::storage::schema::MonitorItem;

use super::{Attempt, FailureKind, ProbeResult, run_with_retries};

/// Per-attempt connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse `host:port` out of the check target. The port is mandatory here;
/// a missing or unparseable port is a config error, not a probe failure.
fn parse_host_port(target: &str) -> Result<(String, u16), ProbeResult> {
    let target = target.trim();
    let stripped = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);

    let Some((host, port_str)) = stripped.rsplit_once(':') else {
        return Err(ProbeResult::fail(
            FailureKind::ConfigInvalid,
            format!("Port not specified in {target}. Format: hostname:port"),
            None,
        )
        .detail("url", json!(target))
        .detail("error", json!("Missing port")));
    };

    match port_str.parse::<u16>() {
        Ok(port) if !host.is_empty() => Ok((host.to_string(), port)),
        _ => Err(ProbeResult::fail(
            FailureKind::ConfigInvalid,
            format!("Invalid port number in {target}"),
            None,
        )
        .detail("url", json!(target))
        .detail("error", json!("Invalid port"))),
    }
}

/// Success when `connect(host, port)` succeeds within the timeout.
#[instrument(fields(monitor_id = item.id))]
pub async fn check_tcp_port(item: &MonitorItem) -> ProbeResult {
    let (host, port) = match parse_host_port(&item.url_check) {
        Ok(parsed) => parsed,
        Err(result) => {
            // Unparseable target: fail without burning retries.
            return run_with_retries("tcp", |_| {
                let result = result.clone();
                async move { Attempt::Abort(result) }
            })
            .await;
        }
    };

    run_with_retries("tcp", |_| {
        let host = host.clone();
        async move {
            let start = Instant::now();
            let connect = TcpStream::connect((host.as_str(), port));
            match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(stream)) => {
                    let response_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                    drop(stream);
                    Attempt::Success(
                        ProbeResult::ok(
                            format!("TCP connection successful to {host}:{port}"),
                            Some(response_time_ms),
                        )
                        .detail("hostname", json!(host))
                        .detail("port", json!(port))
                        .detail("connection_time_ms", json!(response_time_ms)),
                    )
                }
                Ok(Err(e)) => {
                    let response_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                    let (kind, message) = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                        (
                            FailureKind::TransportRefused,
                            format!("TCP connection refused to {host}:{port}"),
                        )
                    } else {
                        (
                            FailureKind::TransportOther,
                            format!("TCP connection error to {host}:{port}: {e}"),
                        )
                    };
                    Attempt::Retry(
                        ProbeResult::fail(kind, message, Some(response_time_ms))
                            .detail("hostname", json!(host))
                            .detail("port", json!(port)),
                    )
                }
                Err(_) => {
                    let response_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                    Attempt::Retry(
                        ProbeResult::fail(
                            FailureKind::TransportTimeout,
                            format!("TCP connection timeout to {host}:{port}"),
                            Some(response_time_ms),
                        )
                        .detail("hostname", json!(host))
                        .detail("port", json!(port))
                        .detail("timeout", json!(true)),
                    )
                }
            }
        }
    })
    .await
}

/// Inverted semantics: success when the port is closed or filtered.
///
/// The normal probe runs to completion (retries included) and only the
/// final verdict is flipped, so an open port reports failure immediately
/// while a closed one still spends the usual retry budget.
#[instrument(fields(monitor_id = item.id))]
pub async fn check_tcp_port_closed(item: &MonitorItem) -> ProbeResult {
    let mut result = check_tcp_port(item).await;

    // A config error is a config error in either direction.
    if result.failure_kind() == Some(FailureKind::ConfigInvalid.as_str()) {
        return result;
    }

    result.success = !result.success;
    if result.success {
        result.message = format!("Port is closed/filtered (as expected): {}", result.message);
        result.details.remove("kind");
    } else {
        result.message = format!("Port is open (unexpected): {}", result.message);
        result
            .details
            .insert("kind".to_string(), json!(FailureKind::TransportOther.as_str()));
    }
    result
}
