//! ICMP echo probe.
//!
//! Shells out to the OS `ping` utility (one echo, 5 s reply window) instead
//! of opening a raw socket, so the service does not need elevated
//! privileges. The reported RTT is parsed out of the tool's output when
//! available; the wall-clock duration of the subprocess is the fallback.

use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::json;
use tokio::process::Command;
use tracing::instrument;

use crate::storage::schema::MonitorItem;

use super::{Attempt, FailureKind, ProbeResult, hostname_of, run_with_retries};

/// Hard cap on one ping subprocess.
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(target_os = "windows")]
fn ping_command(host: &str) -> Command {
    let mut cmd = Command::new("ping");
    cmd.args(["-n", "1", "-w", "5000", host]);
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn ping_command(host: &str) -> Command {
    let mut cmd = Command::new("ping");
    cmd.args(["-c", "1", "-W", "5", host]);
    cmd.kill_on_drop(true);
    cmd
}

/// Extract the reported round-trip time from ping output.
fn parse_rtt(stdout: &str) -> Option<f64> {
    // Linux/Unix: "time=1.234 ms"; Windows: "time=1ms" / "time<1ms"
    let re = Regex::new(r"time[<=](\d+\.?\d*)\s*ms").ok()?;
    re.captures(stdout)?
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
}

/// One ICMP echo; success when a reply arrives.
#[instrument(fields(monitor_id = item.id))]
pub async fn ping_icmp(item: &MonitorItem) -> ProbeResult {
    let host = hostname_of(&item.url_check);
    if host.is_empty() {
        return ProbeResult::fail(
            FailureKind::ConfigInvalid,
            "Invalid hostname for ICMP ping",
            None,
        )
        .detail("hostname", json!(item.url_check))
        .detail("retry_attempts", json!(0));
    }

    run_with_retries("icmp", |_| {
        let host = host.clone();
        async move {
            let start = Instant::now();
            let mut cmd = ping_command(&host);

            let output = match tokio::time::timeout(SUBPROCESS_TIMEOUT, cmd.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Attempt::Retry(
                        ProbeResult::fail(
                            FailureKind::TransportOther,
                            format!("ICMP ping error: {e}"),
                            Some(start.elapsed().as_secs_f64() * 1000.0),
                        )
                        .detail("hostname", json!(host)),
                    );
                }
                Err(_) => {
                    return Attempt::Retry(
                        ProbeResult::fail(
                            FailureKind::TransportTimeout,
                            format!("ICMP ping timeout after 10 seconds to {host}"),
                            None,
                        )
                        .detail("hostname", json!(host))
                        .detail("timeout", json!(true)),
                    );
                }
            };

            let total_time_ms = start.elapsed().as_secs_f64() * 1000.0;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if output.status.success() {
                let rtt = parse_rtt(&stdout);
                Attempt::Success(
                    ProbeResult::ok(
                        format!("ICMP ping successful to {host}"),
                        Some(rtt.unwrap_or(total_time_ms)),
                    )
                    .detail("hostname", json!(host))
                    .detail("ping_time_ms", json!(rtt))
                    .detail("total_time_ms", json!(total_time_ms)),
                )
            } else {
                let diagnostic = if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                };
                Attempt::Retry(
                    ProbeResult::fail(
                        FailureKind::TransportOther,
                        format!("ICMP ping failed to {host}: {diagnostic}"),
                        Some(total_time_ms),
                    )
                    .detail("hostname", json!(host))
                    .detail("return_code", json!(output.status.code())),
                )
            }
        }
    })
    .await
}
