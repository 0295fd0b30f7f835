//! Pod attach/release RPC surface.
//!
//! The container runtime's plugin talks JSON over a Unix domain socket:
//! `POST /v1/assign` and `POST /v1/release`, each carrying the pod identity
//! and answering with the address and device number. The handlers wrap the
//! datastore directly; no pool logic lives here.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use ipam_core::{DataStore, Error, PodKey, PodRequest};
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tracing::info;

use crate::metrics::Metrics;

#[derive(Clone)]
struct RpcState {
    datastore: Arc<DataStore>,
    metrics: Arc<Metrics>,
}

/// Pod identity as sent by the runtime
#[derive(Debug, Clone, Deserialize)]
pub struct PodIdentifier {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub container_id: String,
}

#[derive(Debug, Serialize)]
struct AddressReply {
    ip: Ipv4Addr,
    device_number: u32,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: &'static str,
    message: String,
}

/// Build the RPC router.
pub fn rpc_router(datastore: Arc<DataStore>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/v1/assign", post(assign))
        .route("/v1/release", post(release))
        .with_state(RpcState { datastore, metrics })
}

/// Bind the Unix socket and serve pod RPCs until the process exits.
///
/// A stale socket from a previous run is removed first; the runtime's
/// plugin reconnects per request.
pub async fn serve(socket: &Path, router: Router) -> std::io::Result<()> {
    let _ = std::fs::remove_file(socket);
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket)?;
    info!(socket = %socket.display(), "pod RPC listening");
    axum::serve(listener, router).await
}

async fn assign(State(state): State<RpcState>, Json(pod): Json<PodIdentifier>) -> Response {
    let request = PodRequest::new(pod.name, pod.namespace, pod.container_id);
    match state.datastore.assign(&request) {
        Ok((ip, device_number)) => Json(AddressReply { ip, device_number }).into_response(),
        Err(err) => {
            if matches!(err, Error::InconsistentPodIp { .. }) {
                state.metrics.record_inconsistent_pod_ip();
            }
            error_response(err)
        }
    }
}

async fn release(State(state): State<RpcState>, Json(pod): Json<PodIdentifier>) -> Response {
    let key = PodKey {
        name: pod.name,
        namespace: pod.namespace,
        container: pod.container_id,
    };
    match state.datastore.release(&key) {
        Ok((ip, device_number)) => Json(AddressReply { ip, device_number }).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: Error) -> Response {
    let (status, code) = match err {
        Error::NoAddressAvailable => (StatusCode::SERVICE_UNAVAILABLE, "no_address_available"),
        Error::InconsistentPodIp { .. } => (StatusCode::CONFLICT, "inconsistent_pod_ip"),
        Error::UnknownPod => (StatusCode::NOT_FOUND, "unknown_pod"),
        Error::UnknownPodIp => (StatusCode::CONFLICT, "unknown_pod_ip"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    let body = ErrorReply {
        error: code,
        message: err.to_string(),
    };
    (status, Json(body)).into_response()
}
