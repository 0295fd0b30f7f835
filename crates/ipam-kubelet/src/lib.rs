//! Kubelet introspection client.
//!
//! The kubelet serves a read-only view of its pods on port 10255. This
//! client queries it on localhost first and falls back to the node's
//! primary IP, which covers daemons running in a pod network namespace
//! where localhost is not the host. Pods that have not been assigned an
//! address yet are skipped.
//!
//! The container id is not available on this path; rehydrated pod keys get
//! an empty container component.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use ipam_core::error::{Error, Result};
use ipam_core::traits::{LocalPod, NodeAgent};

const KUBELET_LOCAL_URL: &str = "http://localhost:10255/pods";
const KUBELET_PORT: u16 = 10255;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the kubelet's read-only pod listing
pub struct KubeletClient {
    client: reqwest::Client,
}

impl KubeletClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::node_agent(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
}

fn pods_from_list(list: PodList) -> Vec<LocalPod> {
    list.items
        .into_iter()
        .filter_map(|pod| {
            let raw_ip = pod.status.pod_ip?;
            let ip: Ipv4Addr = match raw_ip.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    debug!(
                        pod = %pod.metadata.name,
                        namespace = %pod.metadata.namespace,
                        ip = %raw_ip,
                        "skipping pod with non-IPv4 address"
                    );
                    return None;
                }
            };
            Some(LocalPod {
                name: pod.metadata.name,
                namespace: pod.metadata.namespace,
                ip,
            })
        })
        .collect()
}

#[async_trait]
impl NodeAgent for KubeletClient {
    async fn local_pods(&self, local_ip: Ipv4Addr) -> Result<Vec<LocalPod>> {
        let response = match self.client.get(KUBELET_LOCAL_URL).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "kubelet not reachable on localhost; retrying via primary IP");
                let fallback = format!("http://{local_ip}:{KUBELET_PORT}/pods");
                self.client.get(&fallback).send().await.map_err(|err| {
                    Error::node_agent(format!("failed to query kubelet at {fallback}: {err}"))
                })?
            }
        };

        let response = response
            .error_for_status()
            .map_err(|err| Error::node_agent(format!("kubelet answered with an error: {err}")))?;
        let list: PodList = response
            .json()
            .await
            .map_err(|err| Error::node_agent(format!("failed to decode pod list: {err}")))?;

        let pods = pods_from_list(list);
        debug!(count = pods.len(), "discovered local pods with addresses");
        Ok(pods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "kind": "PodList",
        "items": [
            {
                "metadata": { "name": "web", "namespace": "default", "uid": "aaa" },
                "status": { "phase": "Running", "hostIP": "10.0.0.1", "podIP": "10.0.0.10" }
            },
            {
                "metadata": { "name": "pending", "namespace": "default" },
                "status": { "phase": "Pending" }
            },
            {
                "metadata": { "name": "v6", "namespace": "kube-system" },
                "status": { "podIP": "fd00::5" }
            }
        ]
    }"#;

    #[test]
    fn parses_kubelet_pod_list() {
        let list: PodList = serde_json::from_str(SAMPLE).unwrap();
        let pods = pods_from_list(list);
        assert_eq!(
            pods,
            vec![LocalPod {
                name: "web".to_string(),
                namespace: "default".to_string(),
                ip: "10.0.0.10".parse().unwrap(),
            }]
        );
    }

    #[test]
    fn empty_list_is_fine() {
        let list: PodList = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(pods_from_list(list).is_empty());
    }

    #[test]
    fn missing_items_field_is_fine() {
        let list: PodList = serde_json::from_str("{}").unwrap();
        assert!(pods_from_list(list).is_empty());
    }
}
