//! L-IPAMD entrypoint: configuration, logging, collaborator construction,
//! then hand off to the daemon loop.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ipam_aws::{Ec2Client, ImdsClient};
use ipam_kubelet::KubeletClient;
use ipam_netlink::NetlinkHostNetwork;
use ipamd::{Collaborators, DaemonConfig};

/// Exit codes following systemd conventions
#[derive(Debug, Clone, Copy)]
enum IpamdExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<IpamdExitCode> for ExitCode {
    fn from(code: IpamdExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

fn main() -> ExitCode {
    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return IpamdExitCode::ConfigError.into();
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("configuration validation error: {err:#}");
        return IpamdExitCode::ConfigError.into();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if let Err(err) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("failed to set up logging: {err}");
        return IpamdExitCode::ConfigError.into();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting L-IPAMD");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build runtime");
            return IpamdExitCode::RuntimeError.into();
        }
    };

    runtime.block_on(async {
        match run(config).await {
            Ok(()) => IpamdExitCode::CleanShutdown.into(),
            Err(err) => {
                error!("daemon failed: {err:#}");
                IpamdExitCode::RuntimeError.into()
            }
        }
    })
}

async fn run(config: DaemonConfig) -> Result<()> {
    let imds = ImdsClient::new().context("failed to build metadata client")?;
    let cloud = Ec2Client::new(&imds, config.secondary_ips_per_eni)
        .await
        .context("failed to build cloud client")?;
    let node_agent = KubeletClient::new().context("failed to build kubelet client")?;
    let host_network =
        NetlinkHostNetwork::new().context("failed to open netlink connection")?;

    let collaborators = Collaborators {
        cloud: Arc::new(cloud),
        metadata: Arc::new(imds),
        node_agent: Arc::new(node_agent),
        host_network: Arc::new(host_network),
    };

    ipamd::run(config, collaborators).await
}
