//! Instance metadata service seam.

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::Result;

/// An ENI as seen from the instance metadata service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EniMetadata {
    /// Cloud-assigned ENI id
    pub eni_id: String,
    /// Hardware address of the interface
    pub mac: String,
    /// Kernel-visible device number of the attachment
    pub device_number: u32,
    /// IPv4 CIDR of the subnet the ENI lives in
    pub subnet_cidr: Ipv4Net,
}

/// Trait for the instance metadata service
///
/// The metadata service is the authority on which ENIs are *actually*
/// attached; the pool manager polls it after requesting an attachment and
/// rehydrates from it on startup.
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// Enumerate the ENIs currently attached to this instance.
    async fn attached_enis(&self) -> Result<Vec<EniMetadata>>;
}
