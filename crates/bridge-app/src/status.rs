use std::io;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Shared by the status endpoints.
#[derive(Clone)]
pub struct StatusState {
    pub metrics: Option<PrometheusHandle>,
    pub probe: Arc<serde_json::Value>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/probe", get(probe))
        .with_state(state)
}

async fn render_metrics(State(state): State<StatusState>) -> (StatusCode, String) {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed\n".to_string(),
        ),
    }
}

async fn probe(State(state): State<StatusState>) -> Json<serde_json::Value> {
    Json(state.probe.as_ref().clone())
}

/// Serves the status endpoints until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: StatusState,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(listen = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("status server shutdown requested");
        })
        .await
}
