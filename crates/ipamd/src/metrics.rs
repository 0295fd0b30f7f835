//! Prometheus metrics for the warm pool.
//!
//! The pool manager publishes [`PoolEvent`]s; [`spawn_event_recorder`]
//! folds them into the gauges and counters here. The RPC layer bumps the
//! inconsistent-pod counter directly.

use std::sync::Arc;

use ipam_core::PoolEvent;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Metrics {
    registry: Registry,
    pool_total: IntGauge,
    pool_assigned: IntGauge,
    current_max_addrs_per_eni: IntGauge,
    max_addrs_per_eni: IntGauge,
    max_enis: IntGauge,
    enis_provisioned: IntCounter,
    enis_released: IntCounter,
    grow_aborted: IntCounter,
    ip_registration_failures: IntCounter,
    inconsistent_pod_ip: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let pool_total = IntGauge::new("ipamd_ip_pool_total", "Addresses in the warm pool")?;
        let pool_assigned =
            IntGauge::new("ipamd_ip_pool_assigned", "Addresses assigned to pods")?;
        let current_max_addrs_per_eni = IntGauge::new(
            "ipamd_current_max_addrs_per_eni",
            "Address capacity observed on the most recently enumerated ENI",
        )?;
        let max_addrs_per_eni = IntGauge::new(
            "ipamd_max_addrs_per_eni",
            "High-water mark of observed per-ENI address capacity",
        )?;
        let max_enis = IntGauge::new(
            "ipamd_max_enis",
            "Discovered instance ENI attachment limit (0 until discovered)",
        )?;
        let enis_provisioned = IntCounter::new(
            "ipamd_enis_provisioned_total",
            "ENIs registered and wired since start",
        )?;
        let enis_released = IntCounter::new(
            "ipamd_enis_released_total",
            "ENIs released back to the cloud since start",
        )?;
        let grow_aborted = IntCounter::new(
            "ipamd_grow_aborted_total",
            "Pool grow attempts abandoned mid-flight",
        )?;
        let ip_registration_failures = IntCounter::new(
            "ipamd_ip_registration_failures_total",
            "Cloud-reported addresses that could not be registered",
        )?;
        let inconsistent_pod_ip = IntCounter::new(
            "ipamd_inconsistent_pod_ip_total",
            "Pods observed claiming a second, different address",
        )?;

        registry.register(Box::new(pool_total.clone()))?;
        registry.register(Box::new(pool_assigned.clone()))?;
        registry.register(Box::new(current_max_addrs_per_eni.clone()))?;
        registry.register(Box::new(max_addrs_per_eni.clone()))?;
        registry.register(Box::new(max_enis.clone()))?;
        registry.register(Box::new(enis_provisioned.clone()))?;
        registry.register(Box::new(enis_released.clone()))?;
        registry.register(Box::new(grow_aborted.clone()))?;
        registry.register(Box::new(ip_registration_failures.clone()))?;
        registry.register(Box::new(inconsistent_pod_ip.clone()))?;

        Ok(Self {
            registry,
            pool_total,
            pool_assigned,
            current_max_addrs_per_eni,
            max_addrs_per_eni,
            max_enis,
            enis_provisioned,
            enis_released,
            grow_aborted,
            ip_registration_failures,
            inconsistent_pod_ip,
        })
    }

    /// Render the registry in Prometheus exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Count a pod that tried to claim a second address.
    pub fn record_inconsistent_pod_ip(&self) {
        self.inconsistent_pod_ip.inc();
    }

    /// Fold one pool event into the metrics.
    pub fn record_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Started { enis } => {
                info!(enis = *enis, "pool manager started");
            }
            PoolEvent::PoolStats {
                total,
                assigned,
                current_max_addrs_per_eni,
                max_addrs_per_eni,
            } => {
                self.pool_total.set(*total as i64);
                self.pool_assigned.set(*assigned as i64);
                self.current_max_addrs_per_eni
                    .set(*current_max_addrs_per_eni as i64);
                self.max_addrs_per_eni.set(*max_addrs_per_eni as i64);
            }
            PoolEvent::EniProvisioned { eni_id } => {
                info!(eni = %eni_id, "ENI provisioned");
                self.enis_provisioned.inc();
            }
            PoolEvent::EniReleased { eni_id } => {
                info!(eni = %eni_id, "ENI released");
                self.enis_released.inc();
            }
            PoolEvent::GrowAborted { reason } => {
                warn!(reason = %reason, "grow attempt abandoned");
                self.grow_aborted.inc();
            }
            PoolEvent::AttachmentLimitDiscovered { max_enis } => {
                self.max_enis.set(*max_enis as i64);
            }
            PoolEvent::IpRegistrationFailed { eni_id, ip } => {
                warn!(eni = %eni_id, ip = %ip, "address registration failed");
                self.ip_registration_failures.inc();
            }
            PoolEvent::RehydrationFailed { pod, inconsistent } => {
                warn!(pod = %pod, "pod rehydration failed");
                if *inconsistent {
                    self.inconsistent_pod_ip.inc();
                }
            }
        }
    }
}

/// Consume pool events into the metrics until the channel closes.
pub fn spawn_event_recorder(
    metrics: Arc<Metrics>,
    mut events: mpsc::Receiver<PoolEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            metrics.record_event(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_stats_update_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.record_event(&PoolEvent::PoolStats {
            total: 28,
            assigned: 14,
            current_max_addrs_per_eni: 15,
            max_addrs_per_eni: 15,
        });
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("ipamd_ip_pool_total 28"));
        assert!(rendered.contains("ipamd_ip_pool_assigned 14"));
        assert!(rendered.contains("ipamd_current_max_addrs_per_eni 15"));
    }

    #[test]
    fn inconsistent_rehydration_counts() {
        let metrics = Metrics::new().unwrap();
        metrics.record_event(&PoolEvent::RehydrationFailed {
            pod: "default/web".to_string(),
            inconsistent: true,
        });
        metrics.record_inconsistent_pod_ip();
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("ipamd_inconsistent_pod_ip_total 2"));
    }
}
