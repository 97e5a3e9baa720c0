//! Health, readiness and metrics endpoints of the controller

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use controller_lib::{health::HealthRegistry, observability::ControllerMetrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: ControllerMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn availability(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// 200 while every component is healthy or degraded, 503 otherwise
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    (availability(health.status.is_operational()), Json(health)).into_response()
}

/// 200 once the Service watch runs and nothing is unhealthy
async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    (availability(readiness.ready), Json(readiness)).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API on `port` until `shutdown` is cancelled
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}
