//! Daemon configuration from environment variables.
//!
//! All tunables default to the production values; every one can be
//! overridden:
//!
//! - `IPAMD_MONITOR_INTERVAL_SECS`: seconds between reconciler ticks (5)
//! - `IPAMD_MIN_ENI_LIFETIME_SECS`: minimum ENI age before teardown (60)
//! - `IPAMD_ADDRESS_COOLING_SECS`: post-release quiet time before teardown (60)
//! - `IPAMD_ENI_ATTACH_WAIT_SECS`: spacing of attach-visibility polls (10)
//! - `IPAMD_MAX_ENI_ATTACH_CHECKS`: attach-visibility poll budget (5)
//! - `IPAMD_SECONDARY_IPS_PER_ENI`: secondary addresses requested per ENI (14)
//! - `IPAMD_HTTP_ADDR`: introspection listen address (0.0.0.0:51678)
//! - `IPAMD_RPC_SOCKET`: pod RPC Unix socket path (/var/run/ipamd.sock)
//! - `IPAMD_LOG_LEVEL`: trace|debug|info|warn|error (info)

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ipam_core::PoolConfig;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:51678";
const DEFAULT_RPC_SOCKET: &str = "/var/run/ipamd.sock";
const DEFAULT_SECONDARY_IPS_PER_ENI: u32 = 14;

/// Full daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub pool: PoolConfig,
    pub http_addr: SocketAddr,
    pub rpc_socket: PathBuf,
    pub secondary_ips_per_eni: u32,
    pub log_level: String,
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut pool = PoolConfig::default();
        if let Some(v) = env_u64("IPAMD_MONITOR_INTERVAL_SECS")? {
            pool.monitor_interval_secs = v;
        }
        if let Some(v) = env_u64("IPAMD_MIN_ENI_LIFETIME_SECS")? {
            pool.min_eni_lifetime_secs = v;
        }
        if let Some(v) = env_u64("IPAMD_ADDRESS_COOLING_SECS")? {
            pool.address_cooling_secs = v;
        }
        if let Some(v) = env_u64("IPAMD_ENI_ATTACH_WAIT_SECS")? {
            pool.eni_attach_wait_secs = v;
        }
        if let Some(v) = env_u64("IPAMD_MAX_ENI_ATTACH_CHECKS")? {
            pool.max_eni_attach_checks = u32::try_from(v)
                .context("IPAMD_MAX_ENI_ATTACH_CHECKS out of range")?;
        }

        let http_addr = env::var("IPAMD_HTTP_ADDR")
            .unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string())
            .parse()
            .context("IPAMD_HTTP_ADDR is not a valid socket address")?;

        let rpc_socket = env::var("IPAMD_RPC_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_RPC_SOCKET));

        let secondary_ips_per_eni = match env_u64("IPAMD_SECONDARY_IPS_PER_ENI")? {
            Some(v) => u32::try_from(v).context("IPAMD_SECONDARY_IPS_PER_ENI out of range")?,
            None => DEFAULT_SECONDARY_IPS_PER_ENI,
        };

        let log_level = env::var("IPAMD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            pool,
            http_addr,
            rpc_socket,
            secondary_ips_per_eni,
            log_level,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        if self.secondary_ips_per_eni == 0 {
            bail!(
                "IPAMD_SECONDARY_IPS_PER_ENI must be at least 1; \
                a warm pool with no handout addresses cannot serve pods"
            );
        }
        if self.rpc_socket.as_os_str().is_empty() {
            bail!("IPAMD_RPC_SOCKET cannot be empty");
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!(
                "IPAMD_LOG_LEVEL '{other}' is not valid. \
                Valid levels: trace, debug, info, warn, error"
            ),
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse::<u64>()
                .with_context(|| format!("{name} must be a non-negative integer, got '{raw}'"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DaemonConfig {
        DaemonConfig {
            pool: PoolConfig::default(),
            http_addr: DEFAULT_HTTP_ADDR.parse().unwrap(),
            rpc_socket: PathBuf::from(DEFAULT_RPC_SOCKET),
            secondary_ips_per_eni: DEFAULT_SECONDARY_IPS_PER_ENI,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn defaults_validate() {
        base_config().validate().unwrap();
    }

    #[test]
    fn zero_secondary_ips_rejected() {
        let config = DaemonConfig {
            secondary_ips_per_eni: 0,
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bogus_log_level_rejected() {
        let config = DaemonConfig {
            log_level: "loud".to_string(),
            ..base_config()
        };
        assert!(config.validate().is_err());
    }
}
