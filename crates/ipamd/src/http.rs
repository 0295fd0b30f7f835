//! Introspection HTTP endpoint.
//!
//! Serves the datastore snapshots and Prometheus metrics on port 51678:
//! `/` lists the data paths, `/v1/enis` and `/v1/pods` return deep-copied
//! JSON views, `/live` and `/ready` answer health probes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ipam_core::{DataStore, EniSnapshot, PodIpInfo};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::metrics::Metrics;

const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Clone)]
struct AppState {
    datastore: Arc<DataStore>,
    metrics: Arc<Metrics>,
}

/// Build the introspection router.
pub fn introspection_router(datastore: Arc<DataStore>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/v1/enis", get(enis))
        .route("/v1/pods", get(pods))
        .route("/metrics", get(metrics_text))
        .route("/live", get(health))
        .route("/ready", get(health))
        .layer(TimeoutLayer::new(HANDLER_TIMEOUT))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { datastore, metrics })
}

/// Bind and serve the introspection endpoint until the process exits.
pub async fn serve(addr: SocketAddr, router: Router) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "introspection endpoint listening");
    axum::serve(listener, router).await
}

async fn index() -> Json<Vec<&'static str>> {
    Json(vec!["/v1/enis", "/v1/pods"])
}

async fn enis(State(state): State<AppState>) -> Json<EniSnapshot> {
    Json(state.datastore.snapshot_enis())
}

async fn pods(State(state): State<AppState>) -> Json<BTreeMap<String, PodIpInfo>> {
    Json(state.datastore.snapshot_pods())
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}
