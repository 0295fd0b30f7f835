//! The L-IPAMD daemon: wiring, introspection, metrics, and the pod RPC
//! surface around `ipam-core`.
//!
//! This crate is a thin integration layer. Pool policy lives in
//! `ipam_core::pool`, assignment bookkeeping in `ipam_core::datastore`; the
//! modules here only translate between the outside world and those two.

pub mod config;
pub mod daemon;
pub mod http;
pub mod metrics;
pub mod rpc;

pub use config::DaemonConfig;
pub use daemon::{run, Collaborators};
pub use metrics::Metrics;
