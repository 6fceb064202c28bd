//! TLS certificate expiry probe.
//!
//! Establishes a TLS session and reads the peer certificate's `notAfter`.
//! Verification is deliberately relaxed: an already-invalid certificate is
//! exactly what this probe needs to report on, so the handshake must not
//! reject it before we can read the expiry.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::net::TcpStream;
use tracing::instrument;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::storage::schema::MonitorItem;

use super::{Attempt, FailureKind, ProbeResult, run_with_retries};

/// Per-attempt budget for connect + handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Certificates must be valid for strictly more than this many days.
const MIN_DAYS_UNTIL_EXPIRY: i64 = 10;

/// Resolve the `(host, port)` target; the port defaults to 443.
fn parse_target(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, target),
    };
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (authority, default_port(scheme)),
        },
        None => (authority, default_port(scheme)),
    };

    if host.is_empty() {
        None
    } else {
        Some((host.to_string(), port))
    }
}

fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some("http") => 80,
        _ => 443,
    }
}

async fn fetch_peer_cert_der(host: &str, port: u16) -> Result<Option<Vec<u8>>, String> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| format!("TLS connector setup failed: {e}"))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| format!("SSL connection error: {e}"))?;
    let stream = connector
        .connect(host, tcp)
        .await
        .map_err(|e| format!("SSL error: {e}"))?;

    let cert = stream
        .get_ref()
        .peer_certificate()
        .map_err(|e| format!("SSL error reading peer certificate: {e}"))?;
    match cert {
        Some(cert) => Ok(Some(
            cert.to_der()
                .map_err(|e| format!("SSL certificate encoding error: {e}"))?,
        )),
        None => Ok(None),
    }
}

/// Success when the certificate expires in strictly more than 10 days.
#[instrument(fields(monitor_id = item.id))]
pub async fn check_certificate(item: &MonitorItem) -> ProbeResult {
    let Some((host, port)) = parse_target(&item.url_check) else {
        return ProbeResult::fail(
            FailureKind::ConfigInvalid,
            "Invalid hostname for SSL check",
            None,
        )
        .detail("url", json!(item.url_check))
        .detail("retry_attempts", json!(0));
    };

    run_with_retries("ssl", |_| {
        let host = host.clone();
        async move {
            let start = Instant::now();
            let fetched = tokio::time::timeout(HANDSHAKE_TIMEOUT, fetch_peer_cert_der(&host, port));
            let response_time_ms = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;

            let der = match fetched.await {
                Ok(Ok(Some(der))) => der,
                Ok(Ok(None)) => {
                    return Attempt::Retry(
                        ProbeResult::fail(
                            FailureKind::Tls,
                            "No SSL certificate found",
                            Some(response_time_ms(start)),
                        )
                        .detail("hostname", json!(host))
                        .detail("port", json!(port)),
                    );
                }
                Ok(Err(message)) => {
                    return Attempt::Retry(
                        ProbeResult::fail(FailureKind::Tls, message, Some(response_time_ms(start)))
                            .detail("hostname", json!(host))
                            .detail("port", json!(port)),
                    );
                }
                Err(_) => {
                    return Attempt::Retry(
                        ProbeResult::fail(
                            FailureKind::TransportTimeout,
                            format!("SSL connection timeout to {host}:{port}"),
                            Some(response_time_ms(start)),
                        )
                        .detail("hostname", json!(host))
                        .detail("port", json!(port))
                        .detail("timeout", json!(true)),
                    );
                }
            };
            let elapsed = response_time_ms(start);

            let (_, cert) = match X509Certificate::from_der(&der) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return Attempt::Retry(
                        ProbeResult::fail(
                            FailureKind::Tls,
                            format!("SSL certificate parse error: {e}"),
                            Some(elapsed),
                        )
                        .detail("hostname", json!(host))
                        .detail("port", json!(port)),
                    );
                }
            };

            let not_after = cert.validity().not_after;
            let now_ts = chrono::Utc::now().timestamp();
            let days_until_expiry = (not_after.timestamp() - now_ts).div_euclid(86_400);
            let expiry_str = not_after.to_string();

            if days_until_expiry > MIN_DAYS_UNTIL_EXPIRY {
                Attempt::Success(
                    ProbeResult::ok(
                        format!("SSL certificate valid, expires in {days_until_expiry} days"),
                        Some(elapsed),
                    )
                    .detail("hostname", json!(host))
                    .detail("port", json!(port))
                    .detail("expiry_date", json!(expiry_str))
                    .detail("days_until_expiry", json!(days_until_expiry))
                    .detail("subject", json!(cert.subject().to_string()))
                    .detail("issuer", json!(cert.issuer().to_string())),
                )
            } else {
                // Expiring soon is a fact about the certificate, not a
                // transient fault; retrying cannot change it.
                Attempt::Abort(
                    ProbeResult::fail(
                        FailureKind::TlsExpiringSoon,
                        format!("SSL certificate expires soon: {days_until_expiry} days"),
                        Some(elapsed),
                    )
                    .detail("hostname", json!(host))
                    .detail("port", json!(port))
                    .detail("expiry_date", json!(expiry_str))
                    .detail("days_until_expiry", json!(days_until_expiry)),
                )
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_target_variants() {
        assert_eq!(
            parse_target("https://example.com"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_target("https://example.com:8443/path"),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(
            parse_target("example.com:993"),
            Some(("example.com".to_string(), 993))
        );
        assert_eq!(
            parse_target("example.com"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(parse_target(""), None);
    }

    #[test]
    fn test_boundary_ten_days_is_failure() {
        // days == 10 must fail the strict `> 10` rule.
        assert!(!(10 > MIN_DAYS_UNTIL_EXPIRY));
        assert!(11 > MIN_DAYS_UNTIL_EXPIRY);
    }
}
