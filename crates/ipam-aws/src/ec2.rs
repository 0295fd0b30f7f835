//! EC2 network-interface client.
//!
//! Implements the cloud side of the warm pool: create + attach ENIs, load
//! them with secondary addresses, enumerate them, and detach + delete on
//! shrink. Instance facts (subnet, security groups, primary ENI) are read
//! once from the metadata service at construction; they cannot change for
//! a running instance.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::Filter;
use ipnet::Ipv4Net;
use tokio::time::sleep;
use tracing::{debug, warn};

use ipam_core::error::{Error, Result};
use ipam_core::traits::{CloudApi, EniAddress};

use crate::imds::ImdsClient;

const ENI_DESCRIPTION: &str = "ipamd managed ENI";
const DELETE_RETRIES: u32 = 5;
const DELETE_BACKOFF: Duration = Duration::from_secs(2);

/// EC2 implementation of the cloud networking API
pub struct Ec2Client {
    ec2: aws_sdk_ec2::Client,
    instance_id: String,
    subnet_id: String,
    security_groups: Vec<String>,
    primary_eni: String,
    local_ip: Ipv4Addr,
    vpc_cidr: Ipv4Net,
    secondary_ips_per_eni: i32,
}

impl Ec2Client {
    /// Build the client, reading instance facts from the metadata service.
    pub async fn new(imds: &ImdsClient, secondary_ips_per_eni: u32) -> Result<Self> {
        let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let ec2 = aws_sdk_ec2::Client::new(&shared);

        let instance_id = imds.instance_id().await?;
        let mac = imds.primary_mac().await?;
        let subnet_id = imds.subnet_id(&mac).await?;
        let security_groups = imds.security_group_ids(&mac).await?;
        let primary_eni = imds.interface_id(&mac).await?;
        let local_ip = imds.local_ipv4().await?;
        let vpc_cidr = imds.vpc_cidr(&mac).await?;

        debug!(
            instance = %instance_id,
            subnet = %subnet_id,
            primary_eni = %primary_eni,
            "EC2 client ready"
        );
        Ok(Self {
            ec2,
            instance_id,
            subnet_id,
            security_groups,
            primary_eni,
            local_ip,
            vpc_cidr,
            secondary_ips_per_eni: secondary_ips_per_eni as i32,
        })
    }

    /// Next free device index: one past the highest attached index.
    async fn next_device_index(&self) -> Result<i32> {
        let output = self
            .ec2
            .describe_network_interfaces()
            .filters(
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(&self.instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify("DescribeNetworkInterfaces", err))?;
        let next = output
            .network_interfaces()
            .iter()
            .filter_map(|eni| eni.attachment().and_then(|att| att.device_index()))
            .max()
            .map_or(1, |max| max + 1);
        Ok(next)
    }

    /// Delete an ENI that was created but never attached.
    async fn delete_orphan(&self, eni_id: &str) {
        if let Err(err) = self
            .ec2
            .delete_network_interface()
            .network_interface_id(eni_id)
            .send()
            .await
        {
            warn!(
                eni = %eni_id,
                error = %DisplayErrorContext(&err),
                "failed to delete unattached ENI; it will linger until cleaned up"
            );
        }
    }
}

#[async_trait]
impl CloudApi for Ec2Client {
    async fn allocate_eni(&self) -> Result<String> {
        let created = self
            .ec2
            .create_network_interface()
            .subnet_id(&self.subnet_id)
            .set_groups(Some(self.security_groups.clone()))
            .description(ENI_DESCRIPTION)
            .send()
            .await
            .map_err(|err| classify("CreateNetworkInterface", err))?;
        let eni_id = created
            .network_interface()
            .and_then(|eni| eni.network_interface_id())
            .ok_or_else(|| Error::cloud("CreateNetworkInterface returned no interface id"))?
            .to_string();

        let device_index = match self.next_device_index().await {
            Ok(index) => index,
            Err(err) => {
                self.delete_orphan(&eni_id).await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .ec2
            .attach_network_interface()
            .network_interface_id(&eni_id)
            .instance_id(&self.instance_id)
            .device_index(device_index)
            .send()
            .await
        {
            let err = classify("AttachNetworkInterface", err);
            self.delete_orphan(&eni_id).await;
            return Err(err);
        }

        debug!(eni = %eni_id, device_index, "allocated and attached ENI");
        Ok(eni_id)
    }

    async fn allocate_all_ips(&self, eni_id: &str) -> Result<()> {
        self.ec2
            .assign_private_ip_addresses()
            .network_interface_id(eni_id)
            .secondary_private_ip_address_count(self.secondary_ips_per_eni)
            .send()
            .await
            .map_err(|err| classify("AssignPrivateIpAddresses", err))?;
        Ok(())
    }

    async fn describe_eni(&self, eni_id: &str) -> Result<Vec<EniAddress>> {
        let output = self
            .ec2
            .describe_network_interfaces()
            .network_interface_ids(eni_id)
            .send()
            .await
            .map_err(|err| classify("DescribeNetworkInterfaces", err))?;
        let eni = output
            .network_interfaces()
            .first()
            .ok_or_else(|| Error::cloud(format!("ENI {eni_id} not found")))?;
        let addresses = eni
            .private_ip_addresses()
            .iter()
            .filter_map(|addr| {
                let ip = addr.private_ip_address()?.parse().ok()?;
                Some(EniAddress {
                    ip,
                    primary: addr.primary().unwrap_or(false),
                })
            })
            .collect();
        Ok(addresses)
    }

    async fn free_eni(&self, eni_id: &str) -> Result<()> {
        let output = self
            .ec2
            .describe_network_interfaces()
            .network_interface_ids(eni_id)
            .send()
            .await
            .map_err(|err| classify("DescribeNetworkInterfaces", err))?;
        let attachment_id = output
            .network_interfaces()
            .first()
            .and_then(|eni| eni.attachment())
            .and_then(|att| att.attachment_id())
            .map(str::to_string);

        if let Some(attachment_id) = attachment_id {
            self.ec2
                .detach_network_interface()
                .attachment_id(attachment_id)
                .force(true)
                .send()
                .await
                .map_err(|err| classify("DetachNetworkInterface", err))?;
        }

        // The detach completes asynchronously; keep trying the delete until
        // the attachment is actually gone.
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .ec2
                .delete_network_interface()
                .network_interface_id(eni_id)
                .send()
                .await
            {
                Ok(_) => {
                    debug!(eni = %eni_id, "deleted ENI");
                    return Ok(());
                }
                Err(err) => {
                    if attempt >= DELETE_RETRIES {
                        return Err(classify("DeleteNetworkInterface", err));
                    }
                    debug!(
                        eni = %eni_id,
                        attempt,
                        error = %DisplayErrorContext(&err),
                        "ENI not deletable yet"
                    );
                    sleep(DELETE_BACKOFF).await;
                }
            }
        }
    }

    fn primary_eni_id(&self) -> &str {
        &self.primary_eni
    }

    fn local_ipv4(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn vpc_cidr(&self) -> Ipv4Net {
        self.vpc_cidr
    }
}

fn classify<E>(operation: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if is_attachment_limit(err.code(), err.message()) {
        return Error::AttachmentLimitExceeded;
    }
    Error::cloud(format!("{operation}: {}", DisplayErrorContext(&err)))
}

/// The documented rejection for "this instance cannot attach another ENI",
/// matched on the error code with a message-substring fallback.
fn is_attachment_limit(code: Option<&str>, message: Option<&str>) -> bool {
    code == Some("AttachmentLimitExceeded")
        || message.is_some_and(|msg| msg.contains("AttachmentLimitExceeded"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_limit_matched_by_code() {
        assert!(is_attachment_limit(Some("AttachmentLimitExceeded"), None));
        assert!(!is_attachment_limit(Some("RequestLimitExceeded"), None));
    }

    #[test]
    fn attachment_limit_matched_by_message() {
        assert!(is_attachment_limit(
            None,
            Some("Interface count 4 exceeds the limit: AttachmentLimitExceeded")
        ));
        assert!(!is_attachment_limit(None, Some("throttled")));
    }
}
