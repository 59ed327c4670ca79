//! Health and statistics endpoints.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (is the worker pool up?)
//! - `GET /stats` - Worker pool distribution, registry counts and host usage
//!
//! The `/metrics` endpoint is merged in by the binary from the Prometheus
//! exporter handle.
//!
//! # Health State
//!
//! - `live`: Always true after startup (process is running)
//! - `ready`: True once the worker pool is created, false again on shutdown

use crate::registry::Registry;
use crate::routers::RouterDirectory;
use crate::system_info::{gather_system_info, SystemInfo};
use crate::workers::{PoolStats, WorkerPool};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness for orchestrator probes.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Shared handles read by `/stats`.
#[derive(Clone)]
pub struct StatsSources {
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<Registry>,
    pub routers: Arc<RouterDirectory>,
}

/// Body of `GET /stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub pool: PoolStats,
    pub rooms: usize,
    pub participants: usize,
    pub routers: usize,
    pub system: SystemInfo,
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

/// Create the `/stats` router.
pub fn stats_router(sources: StatsSources) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .with_state(sources)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn stats_handler(State(sources): State<StatsSources>) -> Json<StatsResponse> {
    let (rooms, participants) = sources.registry.counts();
    // sysinfo reads procfs synchronously
    let system = tokio::task::spawn_blocking(gather_system_info)
        .await
        .unwrap_or(SystemInfo {
            cpu_cores: 1,
            cpu_percent: 0,
            memory_percent: 0,
        });
    Json(StatsResponse {
        pool: sources.pool.stats(),
        rooms,
        participants,
        routers: sources.routers.len(),
        system,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::{default_media_codecs, WorkerSettings};
    use crate::locks::LockManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = HealthState::new();
        state.set_ready();
        assert!(state.is_ready());
        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let state = Arc::new(HealthState::new());
        let app = health_router(Arc::clone(&state));

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let app = health_router(Arc::new(HealthState::new()));
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_reports_pool_distribution() {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = Arc::new(WorkerPool::new(
            engine.clone(),
            WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 40100,
                log_level: "warn".to_string(),
            },
            50,
        ));
        pool.create_pool(2).await.unwrap();
        let routers = Arc::new(RouterDirectory::new(
            engine,
            Arc::clone(&pool),
            Arc::new(LockManager::new()),
            default_media_codecs(),
        ));
        routers.get_or_create("room-1").await.unwrap();

        let app = stats_router(StatsSources {
            pool,
            registry: Arc::new(Registry::new()),
            routers,
        });
        let request = Request::builder()
            .uri("/stats")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["routers"], 1);
        assert_eq!(json["rooms"], 0);
        assert_eq!(json["pool"]["total"], 2);
        assert_eq!(json["pool"]["distribution"], serde_json::json!([1, 0]));
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = health_router(Arc::new(HealthState::new()));
        let request = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
