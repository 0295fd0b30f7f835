//! Core library for the node-local IP address management daemon.
//!
//! This library provides the pieces that make up L-IPAMD:
//! - **DataStore**: the in-memory ENI/IP pool with pod-to-address bookkeeping
//! - **PoolManager**: the reconciler that grows and shrinks the warm pool
//!   against the cloud API
//! - **CloudApi / InstanceMetadata / NodeAgent / HostNetwork**: traits for
//!   the external collaborators (cloud control plane, metadata service,
//!   kubelet introspection, kernel network plumbing)
//!
//! The datastore is the only shared mutable state; everything that performs
//! I/O lives behind a trait and is implemented in a sibling crate. The pool
//! manager never holds the datastore lock across an external call.

pub mod config;
pub mod datastore;
pub mod error;
pub mod pool;
pub mod traits;

// Re-export core types for convenience
pub use config::PoolConfig;
pub use datastore::{DataStore, EniSnapshot, PodIpInfo, PodKey, PodRequest, PoolStats};
pub use error::{Error, Result};
pub use pool::{PoolEvent, PoolManager};
pub use traits::{CloudApi, HostNetwork, InstanceMetadata, NodeAgent};
