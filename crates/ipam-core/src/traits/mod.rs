//! Traits for the daemon's external collaborators.
//!
//! - [`CloudApi`]: allocate/describe/release ENIs and their addresses
//! - [`InstanceMetadata`]: enumerate ENIs currently attached to the instance
//! - [`NodeAgent`]: enumerate pods currently scheduled to this node
//! - [`HostNetwork`]: wire an attached ENI into the host network stack
//!
//! All I/O lives behind these seams; the core never blocks the datastore
//! lock on any of them.

pub mod cloud;
pub mod host_network;
pub mod metadata;
pub mod node_agent;

pub use cloud::{CloudApi, EniAddress};
pub use host_network::HostNetwork;
pub use metadata::{EniMetadata, InstanceMetadata};
pub use node_agent::{LocalPod, NodeAgent};
