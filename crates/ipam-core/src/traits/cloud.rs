//! Cloud networking API seam.
//!
//! The pool manager talks to the cloud control plane exclusively through
//! this trait: allocating and attaching ENIs, loading them with secondary
//! addresses, enumerating what an ENI actually carries, and releasing ENIs
//! on shrink. Implementations are expected to be slow and fallible; the
//! reconciler calls them outside the datastore lock and survives any
//! single-tick failure.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::Result;

/// One address on an ENI as reported by the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EniAddress {
    /// The private IPv4 address
    pub ip: Ipv4Addr,
    /// Whether this is the ENI's own primary address (never handed to pods)
    pub primary: bool,
}

/// Trait for the cloud networking control plane
///
/// # Errors
///
/// [`allocate_eni`](CloudApi::allocate_eni) must surface the platform's
/// attachment-limit rejection so that
/// [`Error::is_attachment_limit`](crate::Error::is_attachment_limit)
/// recognizes it; everything else is a transient cloud error that the
/// reconciler retries on a later tick.
///
/// Implementations must be thread-safe; the daemon shares one client
/// between the reconciler and startup code.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Allocate a new ENI and attach it to this instance.
    ///
    /// Returns the cloud-assigned ENI id. The attachment is not necessarily
    /// visible in instance metadata yet when this returns.
    async fn allocate_eni(&self) -> Result<String>;

    /// Allocate as many secondary private addresses as the platform allows
    /// on the given ENI. Best-effort: partial success is fine, and the
    /// caller proceeds with whatever `describe_eni` reports afterwards.
    async fn allocate_all_ips(&self, eni_id: &str) -> Result<()>;

    /// List the addresses currently present on an ENI.
    async fn describe_eni(&self, eni_id: &str) -> Result<Vec<EniAddress>>;

    /// Release an ENI back to the cloud (detach + delete).
    async fn free_eni(&self, eni_id: &str) -> Result<()>;

    /// Id of the ENI the instance was launched with.
    fn primary_eni_id(&self) -> &str;

    /// The node's own primary IPv4 address.
    fn local_ipv4(&self) -> Ipv4Addr;

    /// The VPC's IPv4 CIDR block.
    fn vpc_cidr(&self) -> Ipv4Net;
}
