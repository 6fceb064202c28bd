//! Per-user alert policy.
//!
//! Gates error notifications on the user's configured alert windows and
//! global mute, and resolves per-user delivery targets (push token, email).
//! Policy failures always fail *open*: a broken timezone or range string
//! must never cost an operator a real alert.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::storage::StoreHandle;
use crate::storage::schema::MonitorSettings;

/// Fallback zone for unknown numeric offsets.
const DEFAULT_TZ: Tz = chrono_tz::Asia::Ho_Chi_Minh;

/// User policy evaluator.
pub struct UserPolicy {
    store: StoreHandle,
}

impl UserPolicy {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub async fn settings(&self, user_id: i64) -> Option<MonitorSettings> {
        match self.store.monitor_settings(user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(user_id, "failed to load monitor settings: {e}");
                None
            }
        }
    }

    /// Whether alerts may be sent to this user right now.
    pub async fn is_alert_time_allowed(&self, user_id: i64) -> (bool, String) {
        let Some(settings) = self.settings(user_id).await else {
            return (true, "No user settings found, allowing alerts".to_string());
        };
        allowed_at(&settings, Utc::now())
    }

    pub async fn push_token(&self, user_id: i64) -> Option<String> {
        match self.store.push_token(user_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(user_id, "failed to load push token: {e}");
                None
            }
        }
    }

    pub async fn email(&self, user_id: i64) -> Option<String> {
        match self.store.user_email(user_id).await {
            Ok(email) => email.filter(|e| !e.trim().is_empty()),
            Err(e) => {
                warn!(user_id, "failed to load user email: {e}");
                None
            }
        }
    }
}

/// Shared handle used by the dispatchers.
pub type PolicyHandle = Arc<UserPolicy>;

/// Pure window evaluation at a given instant (extracted for tests).
pub fn allowed_at(settings: &MonitorSettings, now: DateTime<Utc>) -> (bool, String) {
    // Global mute beats everything.
    if let Some(until) = settings.global_stop_alert_to
        && now < until
    {
        return (false, format!("Global alert stopped until {until}"));
    }

    let Some(ranges) = settings
        .alert_time_ranges
        .as_deref()
        .filter(|r| !r.trim().is_empty())
    else {
        return (true, "Alert allowed".to_string());
    };

    let tz = match resolve_timezone(settings.timezone.as_deref()) {
        Ok(tz) => tz,
        Err(raw) => {
            // Config bugs never suppress alerts.
            warn!(
                user_id = settings.user_id,
                "timezone '{raw}' could not be resolved"
            );
            return (true, "Timezone error, allowing alerts".to_string());
        }
    };

    let local = now.with_timezone(&tz);
    let current = local.format("%H:%M").to_string();

    for range in ranges.split(',') {
        let Some((start, end)) = range.trim().split_once('-') else {
            continue;
        };
        let (start, end) = (start.trim(), end.trim());
        // Invalid window specs are skipped, not fatal.
        if !start.contains(':') || !end.contains(':') {
            continue;
        }
        // Inclusive HH:MM string comparison.
        if start <= current.as_str() && current.as_str() <= end {
            debug!(
                user_id = settings.user_id,
                "alert window hit: {start}-{end} (current: {current} {tz})"
            );
            return (true, "Alert allowed".to_string());
        }
    }

    (
        false,
        format!("Outside allowed time ranges: {ranges} (current: {current} {tz})"),
    )
}

/// Map a stored timezone value (numeric UTC offset or IANA name) to a zone.
///
/// Returns the raw string on failure so callers can log it.
fn resolve_timezone(raw: Option<&str>) -> Result<Tz, String> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(DEFAULT_TZ);
    };

    if let Ok(offset) = raw.parse::<f64>() {
        // Fixed table of the deployments we actually serve; unknown
        // offsets fall back to the default zone.
        let tz = match (offset * 10.0).round() as i64 {
            70 => chrono_tz::Asia::Ho_Chi_Minh,
            0 => chrono_tz::Tz::UTC,
            80 => chrono_tz::Asia::Shanghai,
            90 => chrono_tz::Asia::Tokyo,
            55 => chrono_tz::Asia::Kolkata,
            60 => chrono_tz::Asia::Dhaka,
            -50 => chrono_tz::America::New_York,
            -80 => chrono_tz::America::Los_Angeles,
            -60 => chrono_tz::America::Chicago,
            10 => chrono_tz::Europe::Berlin,
            20 => chrono_tz::Europe::Helsinki,
            30 => chrono_tz::Europe::Moscow,
            40 => chrono_tz::Asia::Dubai,
            50 => chrono_tz::Asia::Karachi,
            100 => chrono_tz::Australia::Sydney,
            _ => DEFAULT_TZ,
        };
        return Ok(tz);
    }

    Tz::from_str(raw).map_err(|_| raw.to_string())
}
