//! Error types for the IPAM daemon.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for IPAM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the IPAM daemon
///
/// The datastore variants map one-to-one onto the operations that produce
/// them; `DuplicateEni` and `DuplicateIp` are benign during rediscovery and
/// callers on that path must treat them as such (see [`Error::is_duplicate`]).
#[derive(Error, Debug)]
pub enum Error {
    /// An ENI with this id is already registered
    #[error("datastore: duplicate ENI {0}")]
    DuplicateEni(String),

    /// This IP address is already registered on some ENI
    #[error("datastore: duplicate IP {ip} (already on ENI {eni_id})")]
    DuplicateIp {
        /// ENI that already holds the address
        eni_id: String,
        /// The duplicated address
        ip: Ipv4Addr,
    },

    /// IP registration referenced an ENI that was never registered
    #[error("datastore: unknown ENI {0}")]
    UnknownEni(String),

    /// A pod key is already bound to a different address
    #[error("datastore: pod {pod} already bound to {existing}, refusing {requested}")]
    InconsistentPodIp {
        /// The offending pod key
        pod: String,
        /// Address currently bound
        existing: Ipv4Addr,
        /// Address the caller asked for
        requested: Ipv4Addr,
    },

    /// Every registered address is assigned; the pool must grow
    #[error("datastore: no available IP addresses")]
    NoAddressAvailable,

    /// Release asked about a pod with no binding
    #[error("datastore: unknown pod")]
    UnknownPod,

    /// A pod binding points at an address the datastore does not consider assigned
    #[error("datastore: pod using unknown IP address")]
    UnknownPodIp,

    /// No ENI currently satisfies the teardown predicate
    #[error("datastore: no ENI can be deleted at this time")]
    NoDeletableEni,

    /// The cloud refused another ENI attachment for this instance
    #[error("cloud: ENI attachment limit exceeded")]
    AttachmentLimitExceeded,

    /// An ENI never showed up in instance metadata after attachment
    #[error("ENI {0} did not appear in instance metadata")]
    EniAttachTimeout(String),

    /// Cloud networking API errors
    #[error("cloud API error: {0}")]
    Cloud(String),

    /// Instance metadata service errors
    #[error("instance metadata error: {0}")]
    Metadata(String),

    /// Node agent (kubelet introspection) errors
    #[error("node agent error: {0}")]
    NodeAgent(String),

    /// Host network plumbing errors
    #[error("host network error: {0}")]
    HostNetwork(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a cloud API error
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create an instance metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a node agent error
    pub fn node_agent(msg: impl Into<String>) -> Self {
        Self::NodeAgent(msg.into())
    }

    /// Create a host network error
    pub fn host_network(msg: impl Into<String>) -> Self {
        Self::HostNetwork(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the duplicate-registration errors that rediscovery treats as
    /// a no-op rather than a failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEni(_) | Self::DuplicateIp { .. })
    }

    /// True when the cloud reported that the instance cannot attach another
    /// ENI. Matches the typed variant as well as the documented error string
    /// surfaced through a generic cloud error.
    pub fn is_attachment_limit(&self) -> bool {
        match self {
            Self::AttachmentLimitExceeded => true,
            Self::Cloud(msg) => msg.contains("AttachmentLimitExceeded"),
            _ => false,
        }
    }
}
