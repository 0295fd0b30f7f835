//! Instance metadata service client.
//!
//! Walks the per-mac tree under `network/interfaces/macs/` to enumerate
//! attached ENIs, and exposes the handful of instance facts the EC2 client
//! needs at construction time. Uses IMDSv2 session tokens, falling back to
//! v1 when the token endpoint is unavailable.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::debug;

use ipam_core::error::{Error, Result};
use ipam_core::traits::{EniMetadata, InstanceMetadata};

const IMDS_BASE: &str = "http://169.254.169.254/latest";
const TOKEN_TTL_SECS: &str = "21600";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for the EC2 instance metadata service
pub struct ImdsClient {
    client: reqwest::Client,
    base: String,
}

impl ImdsClient {
    pub fn new() -> Result<Self> {
        Self::with_base(IMDS_BASE)
    }

    /// Construct against a non-standard endpoint (tests, simulators).
    pub fn with_base(base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::metadata(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }

    /// Fetch an IMDSv2 session token; `None` means fall back to v1.
    async fn session_token(&self) -> Option<String> {
        let response = self
            .client
            .put(format!("{}/api/token", self.base))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }

    async fn get_with(&self, token: &Option<String>, path: &str) -> Result<String> {
        let mut request = self.client.get(format!("{}/meta-data/{}", self.base, path));
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| Error::metadata(format!("GET {path}: {err}")))?
            .error_for_status()
            .map_err(|err| Error::metadata(format!("GET {path}: {err}")))?;
        let body = response
            .text()
            .await
            .map_err(|err| Error::metadata(format!("GET {path}: {err}")))?;
        Ok(body.trim().to_string())
    }

    async fn get(&self, path: &str) -> Result<String> {
        let token = self.session_token().await;
        self.get_with(&token, path).await
    }

    /// The node's own primary IPv4 address.
    pub async fn local_ipv4(&self) -> Result<Ipv4Addr> {
        let raw = self.get("local-ipv4").await?;
        raw.parse()
            .map_err(|_| Error::metadata(format!("invalid local-ipv4 '{raw}'")))
    }

    /// MAC of the primary interface.
    pub async fn primary_mac(&self) -> Result<String> {
        self.get("mac").await
    }

    pub async fn instance_id(&self) -> Result<String> {
        self.get("instance-id").await
    }

    pub async fn interface_id(&self, mac: &str) -> Result<String> {
        self.get(&format!("network/interfaces/macs/{mac}/interface-id"))
            .await
    }

    pub async fn subnet_id(&self, mac: &str) -> Result<String> {
        self.get(&format!("network/interfaces/macs/{mac}/subnet-id"))
            .await
    }

    pub async fn security_group_ids(&self, mac: &str) -> Result<Vec<String>> {
        let raw = self
            .get(&format!("network/interfaces/macs/{mac}/security-group-ids"))
            .await?;
        Ok(parse_listing(&raw))
    }

    pub async fn vpc_cidr(&self, mac: &str) -> Result<Ipv4Net> {
        let raw = self
            .get(&format!("network/interfaces/macs/{mac}/vpc-ipv4-cidr-block"))
            .await?;
        raw.parse()
            .map_err(|_| Error::metadata(format!("invalid VPC CIDR '{raw}'")))
    }
}

/// IMDS listings are newline-separated; mac entries carry a trailing slash.
fn parse_listing(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim().trim_end_matches('/').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[async_trait]
impl InstanceMetadata for ImdsClient {
    async fn attached_enis(&self) -> Result<Vec<EniMetadata>> {
        let token = self.session_token().await;
        let macs = parse_listing(&self.get_with(&token, "network/interfaces/macs/").await?);

        let mut enis = Vec::with_capacity(macs.len());
        for mac in macs {
            let eni_id = self
                .get_with(&token, &format!("network/interfaces/macs/{mac}/interface-id"))
                .await?;
            let device_raw = self
                .get_with(&token, &format!("network/interfaces/macs/{mac}/device-number"))
                .await?;
            let device_number = device_raw.parse::<u32>().map_err(|_| {
                Error::metadata(format!("invalid device number '{device_raw}' for {mac}"))
            })?;
            let subnet_raw = self
                .get_with(
                    &token,
                    &format!("network/interfaces/macs/{mac}/subnet-ipv4-cidr-block"),
                )
                .await?;
            let subnet_cidr = subnet_raw.parse().map_err(|_| {
                Error::metadata(format!("invalid subnet CIDR '{subnet_raw}' for {mac}"))
            })?;

            debug!(eni = %eni_id, %mac, device = device_number, "attached ENI");
            enis.push(EniMetadata {
                eni_id,
                mac,
                device_number,
                subnet_cidr,
            });
        }
        Ok(enis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_listing_drops_trailing_slashes() {
        let raw = "02:ab:cd:ef:00:01/\n02:ab:cd:ef:00:02/\n";
        assert_eq!(
            parse_listing(raw),
            vec!["02:ab:cd:ef:00:01", "02:ab:cd:ef:00:02"]
        );
    }

    #[test]
    fn security_group_listing_plain_lines() {
        let raw = "sg-0123\nsg-4567";
        assert_eq!(parse_listing(raw), vec!["sg-0123", "sg-4567"]);
    }

    #[test]
    fn empty_listing() {
        assert!(parse_listing("").is_empty());
        assert!(parse_listing("\n \n").is_empty());
    }
}
