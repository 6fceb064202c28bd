//! Scheduler and per-item monitor loops.
//!
//! A control loop at a fixed cadence diffs the cache's enabled items
//! against the set of running monitor loops and starts/stops loops to
//! match. Each monitor loop owns one item: it probes at the item's
//! cadence, persists the outcome, hands the transition to the notifier,
//! and terminates itself when the item disappears, is disabled, or any
//! tracked config field changes (the next control tick restarts it with a
//! fresh snapshot and clean alert state).
//!
//! Ordering per item: probe → persist → notify, strictly sequential. The
//! persisted status is durable before any notification goes out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::ItemCache;
use crate::config::Chunk;
use crate::alerts::AlertRegistry;
use crate::notifiers::Notifier;
use crate::probes;
use crate::storage::StoreHandle;
use crate::storage::schema::MonitorItem;

/// Control-loop cadence.
pub const CONTROL_INTERVAL: Duration = Duration::from_secs(5);

/// Largest single sleep inside a monitor loop; keeps stop/shutdown
/// observable even for long item intervals.
const WAIT_QUANTUM: Duration = Duration::from_secs(3);

/// How long loops get to finish on shutdown before being abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared context handed to every monitor loop.
#[derive(Clone)]
struct LoopCtx {
    cache: Arc<ItemCache>,
    store: StoreHandle,
    registry: Arc<AlertRegistry>,
    notifier: Arc<Notifier>,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
}

struct MonitorHandle {
    task: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Scheduler owning the running-loop set.
pub struct Scheduler {
    ctx: LoopCtx,
    chunk: Option<Chunk>,
    running: HashMap<i64, MonitorHandle>,
    /// Exposed to the admin API.
    active_count: Arc<AtomicUsize>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ItemCache>,
        store: StoreHandle,
        registry: Arc<AlertRegistry>,
        notifier: Arc<Notifier>,
        http: reqwest::Client,
        max_concurrent_checks: usize,
        chunk: Option<Chunk>,
        active_count: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            ctx: LoopCtx {
                cache,
                store,
                registry,
                notifier,
                http,
                permits: Arc::new(Semaphore::new(max_concurrent_checks.max(1))),
            },
            chunk,
            running: HashMap::new(),
            active_count,
        }
    }

    /// Control loop; runs until shutdown, then drains monitor loops.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        let mut ticker = tokio::time::interval(CONTROL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile(&shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        info!("scheduler stopped");
    }

    /// One control-loop pass: reap, diff, start, stop.
    pub(crate) async fn reconcile(&mut self, shutdown: &watch::Receiver<bool>) {
        // Reap finished loops; deaths outside shutdown heal next cycle.
        let finished: Vec<i64> = self
            .running
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.running.remove(&id);
            // The loop disposes its own alert state on a clean exit; do it
            // again here so a panicked loop cannot leak state.
            self.ctx.registry.remove(id).await;
            if !*shutdown.borrow() {
                debug!(monitor_id = id, "monitor loop ended, next cycle may restart it");
            }
        }

        // The enabled working set, in id order, chunk filter applied.
        let snapshot = self.ctx.cache.snapshot().await;
        let mut enabled: Vec<MonitorItem> =
            snapshot.values().filter(|it| it.enable).cloned().collect();
        enabled.sort_by_key(|it| it.id);
        if let Some(chunk) = self.chunk {
            enabled = chunk.apply(&enabled);
        }
        let keep_ids: HashSet<i64> = enabled.iter().map(|it| it.id).collect();

        // Stop loops whose item is no longer enabled (or left the chunk).
        for (id, handle) in &self.running {
            if !keep_ids.contains(id) {
                info!(monitor_id = id, "item no longer enabled, signalling stop");
                handle.stop.store(true, Ordering::Relaxed);
            }
        }

        // Start loops for new enabled-and-not-paused items. Paused items
        // are not started; an already-running loop handles its own pause.
        let now = Utc::now();
        for item in enabled {
            if self.running.contains_key(&item.id) || item.is_paused(now) {
                continue;
            }
            let stop = Arc::new(AtomicBool::new(false));
            let task = tokio::spawn(monitor_loop(
                item.clone(),
                self.ctx.clone(),
                stop.clone(),
                shutdown.clone(),
            ));
            self.running.insert(item.id, MonitorHandle { task, stop });
        }

        self.active_count
            .store(self.running.len(), Ordering::Relaxed);
    }

    pub(crate) fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Signal every loop and wait out the grace period.
    async fn drain(&mut self) {
        info!("draining {} monitor loops", self.running.len());
        for handle in self.running.values() {
            handle.stop.store(true, Ordering::Relaxed);
        }

        let tasks: Vec<JoinHandle<()>> = self
            .running
            .drain()
            .map(|(_, handle)| handle.task)
            .collect();
        if timeout(SHUTDOWN_GRACE, join_all(tasks)).await.is_err() {
            warn!(
                "some monitor loops did not finish within {}s, abandoning them",
                SHUTDOWN_GRACE.as_secs()
            );
        }
        self.active_count.store(0, Ordering::Relaxed);
    }
}

/// The long-running task owning a single item.
#[instrument(skip_all, fields(monitor_id = item.id))]
async fn monitor_loop(
    item: MonitorItem,
    ctx: LoopCtx,
    stop: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let monitor_id = item.id;
    info!("starting monitor loop for '{}'", item.name);

    // Fresh alert state for every (re)start of the loop.
    let state = ctx.registry.get(monitor_id).await;
    state.reset().await;

    // The probe outcome is written back into the same result_* columns
    // that count as tracked config. `tracked` follows our own writes (and
    // `prev_tracked` covers the cache catching up one cycle late) so that
    // only an operator edit reads as a config change.
    let mut tracked = item.tracked_fields();
    let mut prev_tracked = tracked.clone();
    let interval = Duration::from_secs(item.effective_interval_secs());
    let mut due = Instant::now();
    let mut check_count = 0u64;

    'run: loop {
        // Wait until due time in short quanta so stop/shutdown are
        // observed promptly.
        loop {
            if stop.load(Ordering::Relaxed) || *shutdown.borrow() {
                break 'run;
            }
            let now = Instant::now();
            if now >= due {
                break;
            }
            let quantum = (due - now).min(WAIT_QUANTUM);
            tokio::select! {
                _ = sleep(quantum) => {}
                _ = shutdown.changed() => {}
            }
        }

        check_count += 1;

        if item.is_paused(Utc::now()) {
            debug!("monitor paused until {:?}, skipping probe", item.stop_to);
        } else {
            // Global concurrency cap on in-flight probes.
            let permit = match ctx.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break 'run,
            };
            if stop.load(Ordering::Relaxed) || *shutdown.borrow() {
                break 'run;
            }

            // Previous persisted status decides the notification
            // transition, so read it before writing the new one.
            let previous_status = match ctx.store.get_item(monitor_id).await {
                Ok(Some(db_item)) => db_item.last_check_status,
                Ok(None) => {
                    info!("item vanished from the store, stopping loop");
                    break 'run;
                }
                Err(e) => {
                    error!("persistence read failed, terminating loop: {e}");
                    break 'run;
                }
            };

            let result = probes::run_check(&item, &ctx.http).await;
            drop(permit);

            let status_str = if result.success { "SUCCESS" } else { "FAILED" };
            let rt = result
                .response_time_ms
                .map(|ms| format!("{ms:.1}ms"))
                .unwrap_or_else(|| "N/A".to_string());
            info!(
                "check #{check_count} {status_str} | {rt} | {} | {}",
                item.name, result.message
            );

            let status = if result.success { 1 } else { -1 };
            let (error_msg, valid_msg) = if result.success {
                (None, Some(result.message.as_str()))
            } else {
                (Some(result.message.as_str()), None)
            };

            // Counters and status must be durable before anyone is told.
            if let Err(e) = ctx
                .store
                .update_probe_result(monitor_id, status, error_msg, valid_msg)
                .await
            {
                error!("persisting probe result failed, terminating loop: {e}");
                break 'run;
            }
            prev_tracked = tracked.clone();
            tracked.result_error = error_msg.map(str::to_string);
            tracked.result_valid = valid_msg.map(str::to_string);

            ctx.notifier
                .handle_probe_outcome(&item, previous_status, &result)
                .await;
        }

        // Config-change detection against the cache after every cycle.
        match ctx.cache.get(monitor_id).await {
            Some(current) => {
                if !current.enable {
                    info!("item disabled, stopping loop");
                    break 'run;
                }
                let current_fields = current.tracked_fields();
                if current_fields != tracked && current_fields != prev_tracked {
                    info!("item config changed, stopping loop for restart");
                    break 'run;
                }
            }
            None => {
                info!("item no longer present, stopping loop");
                break 'run;
            }
        }

        // Next due time; a slow probe never causes catch-up bursts.
        due += interval;
        let now = Instant::now();
        if due < now {
            due = now;
        }
    }

    // Dispose per-item alert state; a restarted loop begins clean.
    ctx.registry.remove(monitor_id).await;
    info!("monitor loop stopped (checks: {check_count})");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::notifiers::Notifier;
    use crate::storage::memory::MemoryStore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(id: i64, url: &str) -> MonitorItem {
        MonitorItem {
            id,
            name: format!("item-{id}"),
            enable: true,
            url_check: url.to_string(),
            check_type: "ping_web".to_string(),
            check_interval_seconds: Some(1),
            user_id: 0,
            last_check_status: None,
            count_online: 0,
            count_offline: 0,
            last_check_time: None,
            result_valid: None,
            result_error: None,
            max_alert_count: None,
            stop_to: None,
            force_restart: false,
            allow_alert_for_consecutive_error: None,
            deleted_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn scheduler_for(store: Arc<MemoryStore>) -> (Scheduler, Arc<ItemCache>) {
        let cache = Arc::new(ItemCache::new(store.clone(), None));
        let registry = Arc::new(AlertRegistry::new());
        let notifier = Arc::new(Notifier::new(registry.clone(), Vec::new()));
        let settings = Settings::from_env();
        let scheduler = Scheduler::new(
            cache.clone(),
            store,
            registry,
            notifier,
            reqwest::Client::new(),
            settings.max_concurrent_checks,
            None,
            Arc::new(AtomicUsize::new(0)),
        );
        (scheduler, cache)
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_stops_loops() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.insert_item(item(1, &server.uri()));
        store.insert_item(item(2, &server.uri()));

        let (mut scheduler, cache) = scheduler_for(store.clone());
        cache.refresh().await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        scheduler.reconcile(&shutdown).await;
        assert_eq!(scheduler.running_ids(), vec![1, 2]);

        // Disable one item: the next pass signals its stop flag, and the
        // loop winds down by itself.
        store.update_item(2, |it| it.enable = false);
        cache.refresh().await.unwrap();
        scheduler.reconcile(&shutdown).await;

        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            scheduler.reconcile(&shutdown).await;
            if scheduler.running_ids() == vec![1] {
                break;
            }
        }
        assert_eq!(scheduler.running_ids(), vec![1]);

        scheduler.drain().await;
    }

    #[tokio::test]
    async fn test_paused_items_are_not_started() {
        let store = Arc::new(MemoryStore::new());
        let mut paused = item(1, "https://unused.invalid");
        paused.stop_to = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert_item(paused);

        let (mut scheduler, cache) = scheduler_for(store);
        cache.refresh().await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        scheduler.reconcile(&shutdown).await;
        assert!(scheduler.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_filter_limits_working_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        for id in 1..=6 {
            store.insert_item(item(id, &server.uri()));
        }

        let cache = Arc::new(ItemCache::new(store.clone(), None));
        let registry = Arc::new(AlertRegistry::new());
        let notifier = Arc::new(Notifier::new(registry.clone(), Vec::new()));
        let mut scheduler = Scheduler::new(
            cache.clone(),
            store,
            registry,
            notifier,
            reqwest::Client::new(),
            10,
            Some(Chunk { number: 2, size: 2 }),
            Arc::new(AtomicUsize::new(0)),
        );
        cache.refresh().await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        scheduler.reconcile(&shutdown).await;
        assert_eq!(scheduler.running_ids(), vec![3, 4]);

        scheduler.drain().await;
    }

    #[tokio::test]
    async fn test_config_change_terminates_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.insert_item(item(1, &server.uri()));

        let (mut scheduler, cache) = scheduler_for(store.clone());
        cache.refresh().await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        scheduler.reconcile(&shutdown).await;
        assert_eq!(scheduler.running_ids(), vec![1]);

        // Edit a tracked field; the loop sees it after its next probe.
        store.update_item(1, |it| it.url_check = format!("{}/edited", server.uri()));

        let mut old_loop_died = false;
        let mut restarted = false;
        for _ in 0..80 {
            sleep(Duration::from_millis(100)).await;
            // Observe the dead handle before reconcile reaps it.
            if scheduler.running.get(&1).is_some_and(|h| h.task.is_finished()) {
                old_loop_died = true;
            }
            cache.refresh().await.unwrap();
            scheduler.reconcile(&shutdown).await;
            if old_loop_died
                && scheduler.running.get(&1).is_some_and(|h| !h.task.is_finished())
            {
                restarted = true;
                break;
            }
        }
        assert!(old_loop_died, "loop never stopped after config change");
        assert!(restarted, "loop never restarted after config change");

        scheduler.drain().await;
    }
}
