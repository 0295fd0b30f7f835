//! Host network plumbing seam.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::Result;

/// Trait for wiring ENIs into the host network stack
///
/// Called by the pool manager once per daemon start (host side) and once
/// per non-primary ENI (interface side). Both calls must be idempotent:
/// the daemon re-runs them for every ENI it rediscovers after a restart.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// One-time host-side setup (policy rules for the VPC CIDR).
    async fn setup_host_network(&self, vpc_cidr: Ipv4Net, primary_ip: Ipv4Addr) -> Result<()>;

    /// Wire one non-primary ENI: bring the link up and populate its
    /// per-device route table.
    async fn setup_eni_network(
        &self,
        eni_primary_ip: Ipv4Addr,
        mac: &str,
        device_number: u32,
        subnet_cidr: Ipv4Net,
    ) -> Result<()>;
}
