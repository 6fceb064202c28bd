//! Instance supervisor.
//!
//! Process-wide lifecycle: the single-instance port lock, the lock file,
//! component wiring, signal handling, and graceful shutdown. One process
//! instance owns one chunk of the enabled-items list; the listen port is
//! offset by the chunk number so instances never collide.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alerts::AlertRegistry;
use crate::api::{ApiState, router};
use crate::cache::ItemCache;
use crate::config::{RunOptions, Settings};
use crate::notifiers::email::EmailDispatcher;
use crate::notifiers::push::PushDispatcher;
use crate::notifiers::telegram::TelegramDispatcher;
use crate::notifiers::webhook::WebhookDispatcher;
use crate::notifiers::{Dispatcher, Notifier};
use crate::policy::UserPolicy;
use crate::scheduler::Scheduler;
use crate::storage::StoreHandle;
use crate::storage::sqlite::SqliteStore;

/// Backoff between boot-path persistence attempts.
const DB_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Extra margin on top of the scheduler's own drain grace.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Contents of the on-disk lock file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub port: u16,
    pub started_at: String,
    pub host: String,
}

/// Lock file for one process instance; removed on clean exit.
pub struct InstanceLock {
    path: std::path::PathBuf,
}

impl InstanceLock {
    /// Lock file name for a chunk: `monitor_service.lock` for chunk 1,
    /// `monitor_service_chunk_N.lock` otherwise.
    pub fn path_for_chunk(chunk_number: u32) -> std::path::PathBuf {
        if chunk_number <= 1 {
            "monitor_service.lock".into()
        } else {
            format!("monitor_service_chunk_{chunk_number}.lock").into()
        }
    }

    pub fn create(chunk_number: u32, port: u16, host: &str) -> anyhow::Result<Self> {
        Self::create_at(Self::path_for_chunk(chunk_number), port, host)
    }

    fn create_at(path: std::path::PathBuf, port: u16, host: &str) -> anyhow::Result<Self> {
        let info = LockInfo {
            pid: std::process::id(),
            port,
            started_at: Utc::now().to_rfc3339(),
            host: host.to_string(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&info)?)
            .with_context(|| format!("failed to write lock file {}", path.display()))?;
        info!("created lock file {} (pid: {}, port: {port})", path.display(), info.pid);
        Ok(Self { path })
    }

    pub fn read(chunk_number: u32) -> Option<LockInfo> {
        Self::read_at(&Self::path_for_chunk(chunk_number))
    }

    fn read_at(path: &std::path::Path) -> Option<LockInfo> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {e}", self.path.display());
        } else {
            info!("removed lock file {}", self.path.display());
        }
    }
}

/// Bind the instance port, or abort with a diagnostic naming the holder.
async fn acquire_instance_port(
    settings: &Settings,
    chunk_number: u32,
) -> anyhow::Result<(TcpListener, u16)> {
    let port = settings.port_for_chunk(chunk_number);
    let addr = format!("{}:{port}", settings.http_host);

    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok((listener, port)),
        Err(e) => {
            let holder = InstanceLock::read(chunk_number)
                .map(|info| {
                    let alive = is_pid_alive(info.pid);
                    format!(
                        "lock file reports pid {} on port {} (process {})",
                        info.pid,
                        info.port,
                        if alive { "still running" } else { "gone" }
                    )
                })
                .unwrap_or_else(|| "no lock file found".to_string());
            anyhow::bail!(
                "another instance appears to hold {addr} ({holder}): {e}"
            )
        }
    }
}

fn is_pid_alive(pid: u32) -> bool {
    let system = sysinfo::System::new_all();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Connect to the configured persistence target.
///
/// Boot-path persistence failures retry forever with a fixed backoff; a
/// signal aborts the wait.
async fn connect_store(
    settings: &Settings,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<StoreHandle> {
    if settings.db.db_type != "sqlite" {
        anyhow::bail!(
            "unsupported DB_TYPE '{}' (built-in backend: sqlite)",
            settings.db.db_type
        );
    }

    loop {
        match SqliteStore::new(&settings.db.path, settings.connection_pool_size).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) => {
                error!(
                    "database connection failed, retrying in {}s: {e}",
                    DB_RETRY_BACKOFF.as_secs()
                );
                tokio::select! {
                    _ = tokio::time::sleep(DB_RETRY_BACKOFF) => {}
                    _ = shutdown.changed() => {
                        anyhow::bail!("shutdown requested while waiting for the database");
                    }
                }
            }
        }
    }
}

/// Shared outbound HTTP client: pooling, keep-alive, bounded per-host
/// idle connections.
pub fn build_http_client(settings: &Settings) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(settings.http_timeout_duration())
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(concat!("uptimed/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

fn build_dispatchers(
    http: &reqwest::Client,
    store: &StoreHandle,
    registry: &Arc<AlertRegistry>,
    policy: &Arc<UserPolicy>,
    settings: &Arc<Settings>,
) -> Vec<Arc<dyn Dispatcher>> {
    vec![
        Arc::new(TelegramDispatcher::new(
            http.clone(),
            store.clone(),
            registry.clone(),
            policy.clone(),
            settings.clone(),
        )),
        Arc::new(WebhookDispatcher::new(
            http.clone(),
            store.clone(),
            registry.clone(),
            policy.clone(),
            settings.clone(),
        )),
        Arc::new(PushDispatcher::new(
            http.clone(),
            registry.clone(),
            policy.clone(),
            settings.clone(),
        )),
        Arc::new(EmailDispatcher::new(
            store.clone(),
            registry.clone(),
            policy.clone(),
            settings.clone(),
        )),
    ]
}

/// First signal: graceful shutdown. Second signal: immediate exit.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut signals_seen = 0u32;
        loop {
            wait_for_signal().await;
            signals_seen += 1;
            match signals_seen {
                1 => {
                    info!("received shutdown signal, initiating graceful shutdown");
                    let _ = shutdown_tx.send(true);
                }
                _ => {
                    error!("received second shutdown signal, forcing immediate exit");
                    std::process::exit(1);
                }
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Boot everything and run until shutdown.
pub async fn run(settings: Settings, opts: RunOptions) -> anyhow::Result<()> {
    let settings = Arc::new(settings);
    let chunk_number = opts.chunk_number();

    let (listener, port) = acquire_instance_port(&settings, chunk_number).await?;
    let lock = InstanceLock::create(chunk_number, port, &settings.http_host)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    let result = run_inner(
        settings,
        opts,
        listener,
        port,
        chunk_number,
        shutdown_tx,
        shutdown_rx,
    )
    .await;

    lock.remove();
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    settings: Arc<Settings>,
    opts: RunOptions,
    listener: TcpListener,
    port: u16,
    chunk_number: u32,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let store = connect_store(&settings, &mut shutdown_rx).await?;

    let cache = Arc::new(ItemCache::new(store.clone(), opts.limit));
    match cache.refresh().await {
        Ok(count) => info!("initial cache load: {count} items"),
        Err(e) => warn!("initial cache load failed, refresher will retry: {e}"),
    }

    let registry = Arc::new(AlertRegistry::new());
    let policy = Arc::new(UserPolicy::new(store.clone()));
    let http = build_http_client(&settings)?;
    let dispatchers = build_dispatchers(&http, &store, &registry, &policy, &settings);
    let notifier = Arc::new(Notifier::new(registry.clone(), dispatchers));

    let active_count = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(
        cache.clone(),
        store.clone(),
        registry.clone(),
        notifier,
        http,
        settings.max_concurrent_checks,
        opts.chunk,
        active_count.clone(),
    );

    info!(
        "instance up: port {port}, chunk {chunk_number}, limit {:?}, max concurrent checks {}",
        opts.limit, settings.max_concurrent_checks
    );

    let refresher = tokio::spawn(cache.clone().run_refresher(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let api_state = Arc::new(ApiState {
        started_at: Utc::now(),
        port,
        chunk_number,
        active_monitors: active_count,
        cache,
        shutdown_tx,
    });
    let mut api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        let app = router(api_state);
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = api_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            error!("admin API server error: {e}");
        }
    });

    // Park until someone (signal, API, second instance) asks us to stop.
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
    info!("shutting down: draining monitor loops");

    if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, scheduler_task)
        .await
        .is_err()
    {
        warn!("scheduler did not stop within the grace period");
    }
    let _ = refresher.await;
    let _ = api_task.await;

    info!("shutdown complete");
    Ok(())
}

/// Single-shot check of the first enabled item (the `test` subcommand).
///
/// Returns `Ok(true)` when the probe succeeded.
pub async fn run_single_check(settings: Settings) -> anyhow::Result<bool> {
    if settings.db.db_type != "sqlite" {
        anyhow::bail!("unsupported DB_TYPE '{}'", settings.db.db_type);
    }
    let store: StoreHandle = Arc::new(
        SqliteStore::new(&settings.db.path, settings.connection_pool_size).await?,
    );

    let items = store.list_enabled_items().await?;
    let Some(item) = items.first() else {
        anyhow::bail!("no enabled monitor items found");
    };

    info!(
        "test mode: checking item {} '{}' ({})",
        item.id, item.name, item.url_check
    );
    let http = build_http_client(&settings)?;
    let result = crate::probes::run_check(item, &http).await;
    info!(
        "test result: success={} time={:?}ms message={}",
        result.success, result.response_time_ms, result.message
    );

    let status = if result.success { 1 } else { -1 };
    let (error_msg, valid_msg) = if result.success {
        (None, Some(result.message.as_str()))
    } else {
        (Some(result.message.as_str()), None)
    };
    store
        .update_probe_result(item.id, status, error_msg, valid_msg)
        .await?;

    Ok(result.success)
}
