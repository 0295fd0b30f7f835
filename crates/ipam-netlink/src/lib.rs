//! Host network plumbing for ipamd.
//!
//! Each non-primary ENI gets its own route table (`100 + device number`)
//! holding the subnet route and an onlink default route via the subnet
//! gateway, plus a policy rule steering traffic sourced from the ENI's
//! primary address into that table. Host-side setup installs a single rule
//! resolving VPC-destined traffic through the main table.
//!
//! Everything is additive and idempotent: re-running against an already
//! wired ENI is a no-op (netlink's "exists" answer is swallowed), which is
//! what the daemon relies on when it rediscovers ENIs after a restart.
//!
//! Only compiles to a working implementation on Linux; elsewhere the
//! constructor fails, mirroring the platform split of the netlink
//! ecosystem.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

const ENI_ROUTE_TABLE_BASE: u32 = 100;
const VPC_RULE_PRIORITY: u32 = 1024;
const ENI_RULE_PRIORITY_BASE: u32 = 1536;

/// Route table dedicated to one ENI.
pub fn eni_route_table(device_number: u32) -> u32 {
    ENI_ROUTE_TABLE_BASE + device_number
}

/// Policy-rule priority for one ENI's source rule.
pub fn eni_rule_priority(device_number: u32) -> u32 {
    ENI_RULE_PRIORITY_BASE + device_number
}

/// The subnet gateway is the first host of the subnet.
pub fn subnet_gateway(subnet: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

/// Parse a colon-separated hardware address.
pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in &mut bytes {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

#[cfg(target_os = "linux")]
mod linux {
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use futures::TryStreamExt;
    use ipnet::Ipv4Net;
    use netlink_packet_route::constants::FR_ACT_TO_TBL;
    use netlink_packet_route::link::nlas::Nla;
    use rtnetlink::Handle;
    use tracing::{debug, info};

    use ipam_core::error::{Error, Result};
    use ipam_core::traits::HostNetwork;

    use super::{eni_route_table, eni_rule_priority, parse_mac, subnet_gateway, VPC_RULE_PRIORITY};

    const MAIN_TABLE: u32 = 254;

    /// Netlink-backed host network configurator
    pub struct NetlinkHostNetwork {
        handle: Handle,
    }

    impl NetlinkHostNetwork {
        /// Open the netlink connection; the connection task runs until the
        /// process exits.
        pub fn new() -> Result<Self> {
            let (connection, handle, _) = rtnetlink::new_connection()
                .map_err(|err| Error::host_network(format!("netlink socket: {err}")))?;
            tokio::spawn(connection);
            Ok(Self { handle })
        }

        async fn link_index_by_mac(&self, mac: &str) -> Result<u32> {
            let wanted = parse_mac(mac)
                .ok_or_else(|| Error::host_network(format!("invalid MAC '{mac}'")))?;
            let mut links = self.handle.link().get().execute();
            while let Some(link) = links
                .try_next()
                .await
                .map_err(|err| Error::host_network(format!("link dump: {err}")))?
            {
                let matches = link
                    .nlas
                    .iter()
                    .any(|nla| matches!(nla, Nla::Address(addr) if addr.as_slice() == wanted));
                if matches {
                    return Ok(link.header.index);
                }
            }
            Err(Error::host_network(format!("no link with MAC {mac}")))
        }
    }

    /// Swallow netlink's "already exists" answer; everything this crate
    /// installs is meant to converge.
    fn tolerate_exists(result: std::result::Result<(), rtnetlink::Error>, what: &str) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref message)) if message.raw_code().abs() == 17 => {
                debug!(what, "already present");
                Ok(())
            }
            Err(err) => Err(Error::host_network(format!("{what}: {err}"))),
        }
    }

    #[async_trait]
    impl HostNetwork for NetlinkHostNetwork {
        async fn setup_host_network(&self, vpc_cidr: Ipv4Net, primary_ip: Ipv4Addr) -> Result<()> {
            let rule = self
                .handle
                .rule()
                .add()
                .v4()
                .destination_prefix(vpc_cidr.network(), vpc_cidr.prefix_len())
                .table_id(MAIN_TABLE)
                .priority(VPC_RULE_PRIORITY)
                .action(FR_ACT_TO_TBL);
            tolerate_exists(rule.execute().await, "VPC rule")?;
            info!(vpc = %vpc_cidr, primary = %primary_ip, "host network ready");
            Ok(())
        }

        async fn setup_eni_network(
            &self,
            eni_primary_ip: Ipv4Addr,
            mac: &str,
            device_number: u32,
            subnet_cidr: Ipv4Net,
        ) -> Result<()> {
            let index = self.link_index_by_mac(mac).await?;
            let table = eni_route_table(device_number);

            tolerate_exists(
                self.handle.link().set(index).up().execute().await,
                "link up",
            )?;

            let subnet_route = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(subnet_cidr.network(), subnet_cidr.prefix_len())
                .output_interface(index)
                .table_id(table);
            tolerate_exists(subnet_route.execute().await, "subnet route")?;

            let default_route = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                .gateway(subnet_gateway(subnet_cidr))
                .output_interface(index)
                .table_id(table);
            tolerate_exists(default_route.execute().await, "default route")?;

            let source_rule = self
                .handle
                .rule()
                .add()
                .v4()
                .source_prefix(eni_primary_ip, 32)
                .table_id(table)
                .priority(eni_rule_priority(device_number))
                .action(FR_ACT_TO_TBL);
            tolerate_exists(source_rule.execute().await, "ENI source rule")?;

            info!(
                %mac,
                device = device_number,
                table,
                subnet = %subnet_cidr,
                "ENI wired into host network"
            );
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::NetlinkHostNetwork;

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use ipnet::Ipv4Net;

    use ipam_core::error::{Error, Result};
    use ipam_core::traits::HostNetwork;

    /// Stub for platforms without netlink; construction fails.
    pub struct NetlinkHostNetwork {
        _private: (),
    }

    impl NetlinkHostNetwork {
        pub fn new() -> Result<Self> {
            Err(Error::host_network(
                "host network plumbing is only supported on Linux",
            ))
        }
    }

    #[async_trait]
    impl HostNetwork for NetlinkHostNetwork {
        async fn setup_host_network(
            &self,
            _vpc_cidr: Ipv4Net,
            _primary_ip: Ipv4Addr,
        ) -> Result<()> {
            Err(Error::host_network(
                "host network plumbing is only supported on Linux",
            ))
        }

        async fn setup_eni_network(
            &self,
            _eni_primary_ip: Ipv4Addr,
            _mac: &str,
            _device_number: u32,
            _subnet_cidr: Ipv4Net,
        ) -> Result<()> {
            Err(Error::host_network(
                "host network plumbing is only supported on Linux",
            ))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::NetlinkHostNetwork;
