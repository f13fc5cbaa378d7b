//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::util::now_ms;
use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Returns status, version, uptime and visitor/terminal counts. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let stats = state.registry.stats().await;

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "timestamp": now_ms(),
        "stats": stats,
    }))
}
