//! Stats HTTP API (§6/§13): five read-only endpoints over the Stats
//! Collector and the Listener Supervisor's server registry.

mod common;

pub use common::{ApiError, ApiResult};

use crate::stats::StatsCollector;
use crate::supervisor::ListenerHandle;
use crate::Result;
use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<StatsCollector>,
    pub servers: Arc<DashMap<String, ListenerHandle>>,
    pub started_at: DateTime<Utc>,
}

/// `GET /api/status`, `/api/stats`, `/api/connections`, `/api/traffic`,
/// `/api/servers` (§6/§13) — the full Stats HTTP API surface.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/stats", get(stats))
        .route("/api/connections", get(connections))
        .route("/api/traffic", get(traffic))
        .route("/api/servers", get(servers))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let router = build_router(state);
    info!("stats HTTP API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "running",
        "started_at": state.started_at,
        "uptime_seconds": uptime,
        "protocol_count": state.servers.len(),
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.stats.snapshot()).unwrap_or(Value::Null))
}

async fn connections(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "connections": state.stats.list_connections() }))
}

async fn traffic(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "total_upload": state.stats.upload_total(),
        "total_download": state.stats.download_total(),
        "hourly": state.stats.hourly(),
    }))
}

async fn servers(State(state): State<AppState>) -> Json<Value> {
    let list: Vec<Value> = state.servers.iter().map(|entry| entry.value().get_status(&state.stats)).collect();
    Json(json!({ "servers": list }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            stats: Arc::new(StatsCollector::new()),
            servers: Arc::new(DashMap::new()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_status_endpoint_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_endpoint_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
