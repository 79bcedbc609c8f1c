// =============================================================================
// Operational API — Axum 0.7
// =============================================================================
//
// Read-only surface for dashboards and scrapers: health, open positions,
// portfolio counters, recent trades, and the Prometheus exposition endpoint.
// The executor takes no commands over HTTP.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::app_state::AppState;

/// Build the API router with shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/portfolio", get(portfolio))
        .route("/api/v1/trades", get(trades))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    open_positions: usize,
    signals_processed: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        open_positions: state.book.len(),
        signals_processed: state.signals_total(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.book.snapshot())
}

async fn portfolio(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "stats": state.risk.snapshot(),
        "max_concurrent_positions": state.settings.max_concurrent_positions,
        "base_position_size_usd": state.settings.base_position_size_usd,
    }))
}

async fn trades(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_trades.read().clone())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}
