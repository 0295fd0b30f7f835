//! AWS implementations of the ipamd collaborator traits.
//!
//! - [`ImdsClient`]: instance metadata service (IMDSv2 with a v1 fallback)
//! - [`Ec2Client`]: EC2 network-interface control plane

pub mod ec2;
pub mod imds;

pub use ec2::Ec2Client;
pub use imds::ImdsClient;
