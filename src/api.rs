//! Admin API.
//!
//! Two routes served from the instance-lock port: a coarse status summary
//! and a shutdown trigger. The read-only dashboard lives elsewhere; this
//! surface exists for the `stop`/`status` CLI subcommands and for ops
//! probes against the service itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::info;

pub struct ApiState {
    pub started_at: DateTime<Utc>,
    pub port: u16,
    pub chunk_number: u32,
    pub active_monitors: Arc<AtomicUsize>,
    pub cache: Arc<crate::cache::ItemCache>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/shutdown", post(shutdown))
        .with_state(state)
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "pid": std::process::id(),
        "port": state.port,
        "chunk": state.chunk_number,
        "started_at": state.started_at.to_rfc3339(),
        "uptime_seconds": uptime,
        "active_monitors": state.active_monitors.load(Ordering::Relaxed),
        "cached_items": state.cache.len().await,
        "cache_fresh": state.cache.is_fresh().await,
    }))
}

async fn shutdown(State(state): State<Arc<ApiState>>) -> Json<Value> {
    info!("shutdown requested via admin API");
    let _ = state.shutdown_tx.send(true);
    Json(json!({ "status": "shutting down" }))
}
