//! Node agent (kubelet introspection) seam.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::Result;

/// A pod currently scheduled to this node, with its already-assigned address
///
/// The introspection path carries no container id, so rehydrated pod keys
/// use an empty container component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPod {
    pub name: String,
    pub namespace: String,
    pub ip: Ipv4Addr,
}

/// Trait for the node agent that knows which pods run on this node
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// List pods scheduled to this node that already hold an address.
    ///
    /// `local_ip` is the node's primary address, used by implementations
    /// that need a fallback endpoint when localhost is not answering.
    async fn local_pods(&self, local_ip: Ipv4Addr) -> Result<Vec<LocalPod>>;
}
