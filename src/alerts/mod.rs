//! Alert manager registry.
//!
//! Per-item mutable alert state: the consecutive-error counter, per-channel
//! send timestamps for throttling, and per-channel episode flags that give
//! webhook and email their send-once semantics. One registry mutex guards
//! the map, one mutex per state guards its counters; neither is ever held
//! across I/O.
//!
//! ## Throttling contract
//!
//! ```text
//! allow_repeat (item flag = 1):
//!   count <= extended_threshold → send if now - last_sent[ch] >= throttle
//!   count >  extended_threshold → throttle raised to max(throttle, extended)
//! default (first-error-only):
//!   send only while consecutive_error_count == 1
//! ```
//!
//! Recovery sends are never time-throttled; they fire once per
//! failure→success transition, gated for webhook/email on an error having
//! been sent for the episode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Notification channels, in registry index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Chat,
    Webhook,
    Push,
    Email,
}

pub const CHANNELS: [Channel; 4] = [Channel::Chat, Channel::Webhook, Channel::Push, Channel::Email];

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Webhook => "webhook",
            Channel::Push => "push",
            Channel::Email => "email",
        }
    }

    fn index(&self) -> usize {
        match self {
            Channel::Chat => 0,
            Channel::Webhook => 1,
            Channel::Push => 2,
            Channel::Email => 3,
        }
    }
}

/// Extended-throttle curve applied once an incident drags on.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleCurve {
    /// Consecutive errors after which the extended interval kicks in.
    pub extended_threshold: u32,
    /// Minimum spacing once past the threshold.
    pub extended_interval: Duration,
}

impl Default for ThrottleCurve {
    fn default() -> Self {
        Self {
            extended_threshold: 5,
            extended_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Default)]
struct StateInner {
    consecutive_errors: u32,
    last_sent: [Option<Instant>; 4],
    error_sent: [bool; 4],
    recovery_sent: [bool; 4],
}

/// Mutable alert state for one monitor item.
pub struct AlertState {
    monitor_id: i64,
    inner: Mutex<StateInner>,
}

impl AlertState {
    fn new(monitor_id: i64) -> Self {
        Self {
            monitor_id,
            inner: Mutex::new(StateInner::default()),
        }
    }

    /// Bump the counter for a failed probe; returns the new count.
    pub async fn increment_consecutive_error(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.consecutive_errors += 1;
        inner.consecutive_errors
    }

    /// Zero the counter for a successful probe; returns the previous count.
    pub async fn reset_consecutive_error(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        std::mem::replace(&mut inner.consecutive_errors, 0)
    }

    pub async fn consecutive_error_count(&self) -> u32 {
        self.inner.lock().await.consecutive_errors
    }

    /// Whether an error alert may go out on `channel` right now.
    pub async fn can_send_alert(
        &self,
        channel: Channel,
        throttle: Duration,
        allow_repeat: bool,
        curve: &ThrottleCurve,
    ) -> bool {
        let inner = self.inner.lock().await;
        let count = inner.consecutive_errors;

        if !allow_repeat {
            // First-error-only: every consecutive failure after the first
            // stays silent until a recovery resets the counter.
            let can = count <= 1;
            if !can {
                debug!(
                    monitor_id = self.monitor_id,
                    channel = channel.as_str(),
                    "throttle mode: skip consecutive error #{count} (only send first error)"
                );
            }
            return can;
        }

        let mut effective = throttle;
        if count > curve.extended_threshold {
            effective = effective.max(curve.extended_interval);
            debug!(
                monitor_id = self.monitor_id,
                channel = channel.as_str(),
                "extended throttling: {}s due to {count} consecutive errors",
                effective.as_secs()
            );
        }

        match inner.last_sent[channel.index()] {
            Some(at) if at.elapsed() < effective => {
                debug!(
                    monitor_id = self.monitor_id,
                    channel = channel.as_str(),
                    "time throttle: {}s still active ({}s remaining)",
                    effective.as_secs(),
                    (effective - at.elapsed()).as_secs()
                );
                false
            }
            _ => true,
        }
    }

    /// Time since the last send on `channel`, if any.
    pub async fn elapsed_since_sent(&self, channel: Channel) -> Option<Duration> {
        self.inner.lock().await.last_sent[channel.index()].map(|at| at.elapsed())
    }

    /// Record a successful send on `channel`.
    pub async fn mark_sent(&self, channel: Channel) {
        self.inner.lock().await.last_sent[channel.index()] = Some(Instant::now());
    }

    /// Record that an error notice opened the current episode on `channel`.
    pub async fn mark_error_sent(&self, channel: Channel) {
        let mut inner = self.inner.lock().await;
        inner.error_sent[channel.index()] = true;
        inner.recovery_sent[channel.index()] = false;
    }

    /// Record the recovery notice that closed the episode on `channel`.
    pub async fn mark_recovery_sent(&self, channel: Channel) {
        let mut inner = self.inner.lock().await;
        inner.recovery_sent[channel.index()] = true;
        inner.error_sent[channel.index()] = false;
    }

    /// Recoveries balance error notices one-for-one: only send when an
    /// error opened the episode and no recovery has closed it yet.
    pub async fn should_send_recovery(&self, channel: Channel) -> bool {
        let inner = self.inner.lock().await;
        inner.error_sent[channel.index()] && !inner.recovery_sent[channel.index()]
    }

    /// Fresh start for a (re)started monitor loop.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = StateInner::default();
    }
}

/// Process-wide `monitor_id → AlertState` map.
#[derive(Default)]
pub struct AlertRegistry {
    states: Mutex<HashMap<i64, Arc<AlertState>>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the state for a monitor, creating it lazily.
    pub async fn get(&self, monitor_id: i64) -> Arc<AlertState> {
        let mut states = self.states.lock().await;
        states
            .entry(monitor_id)
            .or_insert_with(|| Arc::new(AlertState::new(monitor_id)))
            .clone()
    }

    /// Dispose the state when its monitor loop stops.
    pub async fn remove(&self, monitor_id: i64) {
        self.states.lock().await.remove(&monitor_id);
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
