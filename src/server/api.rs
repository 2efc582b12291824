//! Read-only observability API.
//!
//! - GET /health
//! - GET /v1/devices
//! - GET /v1/memory
//! - GET /v1/memory/{device}
//! - GET /v1/cache/stats
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::CacheStats;
use crate::device::{Device, DeviceId};
use crate::memory::{AllocStatsSnapshot, SpillStats, UsageSnapshot};
use crate::metrics::Metrics;
use crate::runtime::Runtime;

/// Application state shared across handlers.
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub metrics: Metrics,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/devices", get(list_devices))
        .route("/v1/memory", get(memory))
        .route("/v1/memory/{device}", get(device_memory))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub devices: usize,
    pub cpu_only: bool,
    pub epoch: u64,
}

#[derive(Debug, Serialize)]
pub struct DeviceList {
    pub devices: Vec<Device>,
}

#[derive(Debug, Serialize)]
pub struct DeviceUsage {
    pub device: DeviceId,
    #[serde(flatten)]
    pub usage: UsageSnapshot,
}

#[derive(Debug, Serialize)]
pub struct MemoryResponse {
    pub devices: Vec<DeviceUsage>,
    pub host: UsageSnapshot,
    pub global_used: u64,
    pub global_ceiling: u64,
    pub allocator: AllocStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub descriptors: CacheStats,
    pub spill: SpillStats,
    pub eviction_rounds: u64,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let rt = &state.runtime;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        devices: rt.devices().len(),
        cpu_only: rt.registry().is_cpu_only(),
        epoch: rt.epoch(),
    })
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<DeviceList> {
    Json(DeviceList {
        devices: state.runtime.devices().to_vec(),
    })
}

async fn memory(State(state): State<Arc<AppState>>) -> Json<MemoryResponse> {
    let rt = &state.runtime;
    let devices = rt
        .snapshots()
        .into_iter()
        .map(|(device, usage)| DeviceUsage { device, usage })
        .collect();

    Json(MemoryResponse {
        devices,
        host: rt.accounting().host_snapshot(),
        global_used: rt.accounting().global_used(),
        global_ceiling: rt.accounting().global_ceiling(),
        allocator: rt.alloc_stats(),
    })
}

async fn device_memory(
    State(state): State<Arc<AppState>>,
    Path(device): Path<DeviceId>,
) -> Result<Json<DeviceUsage>, StatusCode> {
    let usage = state
        .runtime
        .snapshot(device)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(DeviceUsage { device, usage }))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let rt = &state.runtime;
    Json(CacheStatsResponse {
        descriptors: rt.descriptors().stats(),
        spill: rt.spill().stats(),
        eviction_rounds: rt.eviction().rounds(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.metrics.render(&state.runtime).map_err(|err| {
        error!(error = %err, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::native::MemoryKind;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let (rt, _sim) = Runtime::simulated(Config::default(), 2, 1 << 20).unwrap();
        Arc::new(AppState {
            runtime: Arc::new(rt),
            metrics: Metrics::new().unwrap(),
            start_time: Instant::now(),
        })
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(state(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["devices"], 2);
        assert_eq!(body["cpu_only"], false);
    }

    #[tokio::test]
    async fn test_device_memory() {
        let state = state();
        let block = state
            .runtime
            .allocate(1, 1024, MemoryKind::DeviceLocal, false)
            .unwrap();

        let (status, body) = get_json(state.clone(), "/v1/memory/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"], 1);
        assert_eq!(body["used_bytes"], 1024);

        let (status, _) = get_json(state.clone(), "/v1/memory/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get_json(state.clone(), "/v1/memory").await;
        assert_eq!(body["global_used"], 1024);
        assert_eq!(body["allocator"]["allocations"], 1);
        block.free_ref().unwrap();
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let response = build_router(state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("accel_mem_epoch 0"));
    }
}
