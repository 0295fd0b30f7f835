//! Daemon assembly: datastore + pool manager + servers, then wait for a
//! signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use ipam_core::{CloudApi, DataStore, HostNetwork, InstanceMetadata, NodeAgent, PoolManager};
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::http;
use crate::metrics::{self, Metrics};
use crate::rpc;

/// The concrete collaborators the daemon runs against
pub struct Collaborators {
    pub cloud: Arc<dyn CloudApi>,
    pub metadata: Arc<dyn InstanceMetadata>,
    pub node_agent: Arc<dyn NodeAgent>,
    pub host_network: Arc<dyn HostNetwork>,
}

/// Run the daemon until SIGTERM/SIGINT.
///
/// Startup is the only fatal phase: host network setup, the initial ENI
/// listing, and collaborator construction may abort the process. After
/// that, every failure is contained to its tick or request.
pub async fn run(config: DaemonConfig, collaborators: Collaborators) -> Result<()> {
    let datastore = Arc::new(DataStore::with_windows(
        config.pool.min_eni_lifetime(),
        config.pool.address_cooling(),
    ));
    let metrics = Arc::new(Metrics::new().context("failed to build metrics registry")?);

    let (mut manager, events) = PoolManager::new(
        collaborators.cloud,
        collaborators.metadata,
        collaborators.node_agent,
        collaborators.host_network,
        datastore.clone(),
        config.pool.clone(),
    )
    .context("invalid pool configuration")?;

    manager.init().await.context("ipamd startup failed")?;
    info!(
        enis = datastore.eni_count(),
        assigned = datastore.stats().assigned,
        "warm pool rehydrated"
    );

    let _recorder = metrics::spawn_event_recorder(metrics.clone(), events);
    tokio::spawn(manager.run());

    let introspection = http::introspection_router(datastore.clone(), metrics.clone());
    let http_addr = config.http_addr;
    tokio::spawn(async move {
        if let Err(err) = http::serve(http_addr, introspection).await {
            error!(error = %err, "introspection endpoint failed");
        }
    });

    let pod_rpc = rpc::rpc_router(datastore, metrics);
    let rpc_socket = config.rpc_socket.clone();
    tokio::spawn(async move {
        if let Err(err) = rpc::serve(&rpc_socket, pod_rpc).await {
            error!(error = %err, "pod RPC server failed");
        }
    });

    let signal = wait_for_shutdown().await?;
    info!(signal, "shutting down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for CTRL-C")?;
    Ok("SIGINT")
}
