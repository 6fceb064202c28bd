//! Row structs for the monitoring schema.
//!
//! The columns mirror the dashboard-owned tables; this service only ever
//! writes probe outcomes back to `monitor_items`. Legacy column spellings
//! (`stopTo`, `forceRestart`, `maxAlertCount`) are kept at the SQL layer and
//! mapped to snake_case here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default probe cadence when an item has no (or a nonsensical) interval.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

/// One monitor item as stored in `monitor_items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorItem {
    pub id: i64,
    pub name: String,
    pub enable: bool,
    pub url_check: String,
    /// Raw `type` column; parse with [`MonitorItem::kind`].
    pub check_type: String,
    pub check_interval_seconds: Option<i64>,
    pub user_id: i64,
    /// `1` = ok, `-1` = fail, `None` = never checked.
    pub last_check_status: Option<i32>,
    pub count_online: i64,
    pub count_offline: i64,
    pub last_check_time: Option<DateTime<Utc>>,
    pub result_valid: Option<String>,
    pub result_error: Option<String>,
    pub max_alert_count: Option<i64>,
    /// Paused while this is strictly in the future.
    pub stop_to: Option<DateTime<Utc>>,
    /// Scheduler-consumed restart pulse; any change restarts the loop.
    pub force_restart: bool,
    /// `Some(1)` permits repeated alerts under the time throttle; anything
    /// else throttles channels to the first error of an episode.
    pub allow_alert_for_consecutive_error: Option<i32>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Probe kind, with legacy aliases folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    PingWeb,
    PingIcmp,
    /// `tcp` and its alias `open_port_tcp_then_valid`.
    Tcp,
    /// `open_port_tcp_then_error`: success when the port is closed.
    TcpClosed,
    SslExpiry,
    WebContent,
}

impl CheckKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "ping_web" => Some(Self::PingWeb),
            "ping_icmp" => Some(Self::PingIcmp),
            "tcp" | "open_port_tcp_then_valid" => Some(Self::Tcp),
            "open_port_tcp_then_error" => Some(Self::TcpClosed),
            "ssl_expired_check" => Some(Self::SslExpiry),
            "web_content" => Some(Self::WebContent),
            _ => None,
        }
    }
}

/// Config fields whose change terminates a running monitor loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFields {
    pub enable: bool,
    pub name: String,
    pub user_id: i64,
    pub url_check: String,
    pub check_type: String,
    pub max_alert_count: Option<i64>,
    pub check_interval_seconds: Option<i64>,
    pub result_valid: Option<String>,
    pub result_error: Option<String>,
    pub stop_to: Option<DateTime<Utc>>,
    pub force_restart: bool,
}

impl MonitorItem {
    pub fn kind(&self) -> Option<CheckKind> {
        CheckKind::parse(&self.check_type)
    }

    /// Effective probe cadence: default 300 s, floor 1 s.
    pub fn effective_interval_secs(&self) -> u64 {
        match self.check_interval_seconds {
            Some(secs) if secs > 0 => secs as u64,
            _ => DEFAULT_CHECK_INTERVAL_SECS,
        }
    }

    /// Paused while `stop_to` is strictly in the future (`stop_to == now`
    /// means not paused).
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        matches!(self.stop_to, Some(until) if until > now)
    }

    pub fn allow_repeat_alerts(&self) -> bool {
        self.allow_alert_for_consecutive_error == Some(1)
    }

    pub fn tracked_fields(&self) -> TrackedFields {
        TrackedFields {
            enable: self.enable,
            name: self.name.clone(),
            user_id: self.user_id,
            url_check: self.url_check.clone(),
            check_type: self.check_type.clone(),
            max_alert_count: self.max_alert_count,
            check_interval_seconds: self.check_interval_seconds,
            result_valid: self.result_valid.clone(),
            result_error: self.result_error.clone(),
            stop_to: self.stop_to,
            force_restart: self.force_restart,
        }
    }
}

/// Split a comma-separated keyword list, trimming whitespace and dropping
/// empty entries. `None`/blank input yields an empty list.
pub fn split_keywords(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// One alert channel configuration row from `monitor_configs`.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub id: i64,
    pub name: Option<String>,
    pub user_id: i64,
    pub alert_type: String,
    pub alert_config: Option<String>,
}

/// Parsed channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelConfig {
    Telegram { bot_token: String, chat_id: String },
    Webhook { url: String, name: String },
    Email { to: String },
}

impl AlertConfig {
    /// Parse and validate the opaque `alert_config` string for this row's
    /// channel. Returns `None` when the encoding is invalid.
    pub fn parse(&self) -> Option<ChannelConfig> {
        let raw = self.alert_config.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }

        match self.alert_type.as_str() {
            "telegram" => {
                // <bot_token>,<chat_id>, split on the first comma
                let (bot_token, chat_id) = raw.split_once(',')?;
                let bot_token = bot_token.trim();
                let chat_id = chat_id.trim();
                if bot_token.is_empty() || chat_id.is_empty() || !bot_token.contains(':') {
                    return None;
                }
                let numeric = chat_id.strip_prefix('-').unwrap_or(chat_id);
                if !(numeric.chars().all(|c| c.is_ascii_digit()) && !numeric.is_empty()
                    || chat_id.starts_with('@'))
                {
                    return None;
                }
                Some(ChannelConfig::Telegram {
                    bot_token: bot_token.to_string(),
                    chat_id: chat_id.to_string(),
                })
            }
            "webhook" => {
                if !(raw.starts_with("http://") || raw.starts_with("https://")) {
                    return None;
                }
                Some(ChannelConfig::Webhook {
                    url: raw.to_string(),
                    name: self
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("Webhook #{}", self.id)),
                })
            }
            "email" => Some(ChannelConfig::Email {
                to: raw.to_string(),
            }),
            _ => None,
        }
    }
}

/// Per-user alert policy row from `monitor_settings`.
#[derive(Debug, Clone, Default)]
pub struct MonitorSettings {
    pub user_id: i64,
    /// Numeric UTC offset ("7", "5.5") or IANA name ("Asia/Tokyo").
    pub timezone: Option<String>,
    /// Comma-separated `HH:MM-HH:MM` windows.
    pub alert_time_ranges: Option<String>,
    /// Alerts suppressed while now < this.
    pub global_stop_alert_to: Option<DateTime<Utc>>,
    /// Push device token.
    pub firebase_token: Option<String>,
}
