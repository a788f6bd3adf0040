//! Health, readiness and metrics endpoints.
//!
//! - `/healthz` - liveness: the process is running
//! - `/readyz`  - readiness: the controller is initialized and watching
//! - `/metrics` - controller metrics in Prometheus text format

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::metrics::SharedMetrics;

/// Readiness flag flipped by the bootstrap once the watch streams run,
/// and back off again during shutdown so traffic drains.
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub(crate) fn build_router(readiness: ReadinessState, metrics_handle: SharedMetrics) -> Router {
    let state = ServerState {
        readiness,
        metrics: metrics_handle,
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the endpoints until the process exits
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics_handle: SharedMetrics,
) -> Result<(), std::io::Error> {
    let router = build_router(readiness, metrics_handle);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health server listening");
    axum::serve(listener, router).await
}
