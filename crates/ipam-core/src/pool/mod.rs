//! Warm-pool manager.
//!
//! A single long-running reconciler over the datastore and the cloud:
//!
//! 1. **Init** (once): discover attached ENIs from instance metadata,
//!    register them and their addresses, wire non-primary ENIs into the
//!    host network, then re-claim the addresses of pods the node agent
//!    already knows about.
//! 2. **Steady state** (every tick): read the pool counters and grow when
//!    the free headroom drops to at most one ENI's worth of addresses, or
//!    shrink when it exceeds two ENIs' worth.
//!
//! The manager holds no state beyond three scalars (observed per-ENI
//! capacity, its high-water mark, and the discovered attachment limit);
//! everything else is re-read from the datastore each tick, so any single
//! tick may fail with no permanent effect.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::datastore::{DataStore, PodRequest, PoolStats};
use crate::error::{Error, Result};
use crate::traits::{CloudApi, EniAddress, EniMetadata, HostNetwork, InstanceMetadata, NodeAgent};

/// Events published by the pool manager for metrics and logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Init finished; the datastore holds this many ENIs
    Started { enis: usize },

    /// Counters observed at the top of a reconciler tick
    PoolStats {
        total: usize,
        assigned: usize,
        current_max_addrs_per_eni: usize,
        max_addrs_per_eni: usize,
    },

    /// An ENI was registered, enumerated, and wired
    EniProvisioned { eni_id: String },

    /// An ENI was removed from the datastore and released to the cloud
    EniReleased { eni_id: String },

    /// A grow attempt was abandoned for this tick
    GrowAborted { reason: String },

    /// The cloud refused another attachment; the ENI count is now pinned
    AttachmentLimitDiscovered { max_enis: usize },

    /// An address reported by the cloud could not be registered
    IpRegistrationFailed { eni_id: String, ip: Ipv4Addr },

    /// A pod reported by the node agent could not re-claim its address
    RehydrationFailed { pod: String, inconsistent: bool },
}

/// What a reconciler tick should do with the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolAction {
    Grow,
    Shrink,
    Idle,
}

/// Grow when the free headroom is at most one ENI's worth of addresses,
/// shrink when it exceeds two ENIs' worth.
fn required_action(stats: PoolStats, current_max_addrs_per_eni: usize) -> PoolAction {
    let free = stats.free();
    if free <= current_max_addrs_per_eni {
        PoolAction::Grow
    } else if free > 2 * current_max_addrs_per_eni {
        PoolAction::Shrink
    } else {
        PoolAction::Idle
    }
}

/// The warm-pool reconciler
pub struct PoolManager {
    cloud: Arc<dyn CloudApi>,
    metadata: Arc<dyn InstanceMetadata>,
    node_agent: Arc<dyn NodeAgent>,
    host_network: Arc<dyn HostNetwork>,
    datastore: Arc<DataStore>,
    config: PoolConfig,

    /// Address capacity observed on the most recently enumerated ENI
    current_max_addrs_per_eni: usize,
    /// High-water mark of `current_max_addrs_per_eni`
    max_addrs_per_eni: usize,
    /// Attachment limit, once the cloud has revealed it
    max_enis: Option<usize>,

    event_tx: mpsc::Sender<PoolEvent>,
}

impl PoolManager {
    /// Create a pool manager.
    ///
    /// Returns the manager and the receiving end of its event channel.
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        metadata: Arc<dyn InstanceMetadata>,
        node_agent: Arc<dyn NodeAgent>,
        host_network: Arc<dyn HostNetwork>,
        datastore: Arc<DataStore>,
        config: PoolConfig,
    ) -> Result<(Self, mpsc::Receiver<PoolEvent>)> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let manager = Self {
            cloud,
            metadata,
            node_agent,
            host_network,
            datastore,
            config,
            current_max_addrs_per_eni: 0,
            max_addrs_per_eni: 0,
            max_enis: None,
            event_tx,
        };
        Ok((manager, event_rx))
    }

    /// One-time startup: host network, ENI discovery, pod rehydration.
    ///
    /// Failure to set up the host network, list the attached ENIs, or
    /// register a discovered ENI is fatal. A node-agent failure is not:
    /// the daemon keeps running rather than taking the node offline for a
    /// stale kubelet, at the cost of skipping rehydration.
    pub async fn init(&mut self) -> Result<()> {
        let vpc_cidr = self.cloud.vpc_cidr();
        let primary_ip = self.cloud.local_ipv4();
        self.host_network
            .setup_host_network(vpc_cidr, primary_ip)
            .await?;

        let enis = self.metadata.attached_enis().await?;
        for meta in &enis {
            debug!(eni = %meta.eni_id, "discovered attached ENI");
            if let Err(err) = self.cloud.allocate_all_ips(&meta.eni_id).await {
                // Partial allocation is fine; describe_eni below picks up
                // whatever the ENI actually carries.
                warn!(eni = %meta.eni_id, error = %err, "could not allocate all addresses");
            }
            self.setup_eni(meta).await?;
        }
        self.emit(PoolEvent::Started {
            enis: self.datastore.eni_count(),
        });

        let pods = match self.node_agent.local_pods(primary_ip).await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(error = %err, "node agent unavailable; skipping pod rehydration");
                return Ok(());
            }
        };
        for pod in pods {
            let request = PodRequest::with_ip(pod.name, pod.namespace, "", pod.ip);
            if let Err(err) = self.datastore.assign(&request) {
                warn!(
                    pod = %request.name,
                    namespace = %request.namespace,
                    ip = %pod.ip,
                    error = %err,
                    "failed to re-claim pod address"
                );
                self.emit(PoolEvent::RehydrationFailed {
                    pod: format!("{}/{}", request.namespace, request.name),
                    inconsistent: matches!(err, Error::InconsistentPodIp { .. }),
                });
            }
        }
        Ok(())
    }

    /// Run the reconciler until the process exits.
    pub async fn run(self) {
        self.run_internal(None).await;
    }

    /// Run the reconciler until the given shutdown signal fires.
    ///
    /// Production code uses [`run`](Self::run); this variant exists so
    /// tests can stop the loop deterministically.
    pub async fn run_with_shutdown(self, shutdown: oneshot::Receiver<()>) {
        self.run_internal(Some(shutdown)).await;
    }

    async fn run_internal(mut self, shutdown: Option<oneshot::Receiver<()>>) {
        let interval = self.config.monitor_interval();
        if let Some(mut shutdown) = shutdown {
            loop {
                tokio::select! {
                    _ = sleep(interval) => self.reconcile().await,
                    _ = &mut shutdown => {
                        info!("pool manager stopping");
                        break;
                    }
                }
            }
        } else {
            loop {
                sleep(interval).await;
                self.reconcile().await;
            }
        }
    }

    /// One reconciliation pass: observe the counters, then grow or shrink.
    ///
    /// Public so tests (and embedders) can tick the manager without the
    /// timing loop.
    pub async fn reconcile(&mut self) {
        let stats = self.datastore.stats();
        self.emit(PoolEvent::PoolStats {
            total: stats.total,
            assigned: stats.assigned,
            current_max_addrs_per_eni: self.current_max_addrs_per_eni,
            max_addrs_per_eni: self.max_addrs_per_eni,
        });
        match required_action(stats, self.current_max_addrs_per_eni) {
            PoolAction::Grow => self.grow().await,
            PoolAction::Shrink => self.shrink().await,
            PoolAction::Idle => {}
        }
    }

    async fn grow(&mut self) {
        if let Some(max) = self.max_enis {
            if self.datastore.eni_count() >= max {
                debug!(max_enis = max, "attachment limit reached; skipping grow");
                return;
            }
        }

        let eni_id = match self.cloud.allocate_eni().await {
            Ok(id) => id,
            Err(err) if err.is_attachment_limit() => {
                let max_enis = self.datastore.eni_count();
                self.max_enis = Some(max_enis);
                info!(max_enis, error = %err, "discovered instance ENI attachment limit");
                self.emit(PoolEvent::AttachmentLimitDiscovered { max_enis });
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to allocate ENI");
                return;
            }
        };

        if let Err(err) = self.cloud.allocate_all_ips(&eni_id).await {
            warn!(eni = %eni_id, error = %err, "could not allocate all addresses");
        }

        let meta = match self.wait_eni_attached(&eni_id).await {
            Ok(meta) => meta,
            Err(err) => {
                error!(eni = %eni_id, error = %err, "new ENI never became visible");
                self.emit(PoolEvent::GrowAborted {
                    reason: err.to_string(),
                });
                return;
            }
        };

        if let Err(err) = self.setup_eni(&meta).await {
            error!(eni = %eni_id, error = %err, "failed to set up new ENI");
            self.emit(PoolEvent::GrowAborted {
                reason: err.to_string(),
            });
        }
    }

    async fn shrink(&mut self) {
        let eni_id = match self.datastore.free_eni() {
            Ok(id) => id,
            Err(err) => {
                debug!(error = %err, "nothing to shrink this tick");
                return;
            }
        };
        // The datastore has already committed to forgetting the ENI; a
        // failed cloud release leaves an orphan for the operator, not a
        // corrupt pool.
        match self.cloud.free_eni(&eni_id).await {
            Ok(()) => info!(eni = %eni_id, "released ENI"),
            Err(err) => error!(eni = %eni_id, error = %err, "cloud release failed"),
        }
        self.emit(PoolEvent::EniReleased { eni_id });
    }

    /// Register an ENI and its addresses, and wire it into the host.
    async fn setup_eni(&mut self, meta: &EniMetadata) -> Result<()> {
        let eni_id = meta.eni_id.as_str();
        let is_primary = eni_id == self.cloud.primary_eni_id();
        match self
            .datastore
            .register_eni(eni_id, meta.device_number, is_primary)
        {
            Ok(()) => {}
            Err(err) if err.is_duplicate() => {
                debug!(eni = %eni_id, "ENI already registered");
            }
            Err(err) => return Err(err),
        }

        let addresses = self.cloud.describe_eni(eni_id).await?;
        let eni_primary_ip = addresses
            .iter()
            .find(|addr| addr.primary)
            .map(|addr| addr.ip)
            .ok_or_else(|| Error::cloud(format!("no primary address reported for ENI {eni_id}")))?;

        self.current_max_addrs_per_eni = addresses.len();
        if self.current_max_addrs_per_eni > self.max_addrs_per_eni {
            self.max_addrs_per_eni = self.current_max_addrs_per_eni;
        }

        if !is_primary {
            self.host_network
                .setup_eni_network(
                    eni_primary_ip,
                    &meta.mac,
                    meta.device_number,
                    meta.subnet_cidr,
                )
                .await?;
        }

        self.register_addresses(eni_id, &addresses);
        self.emit(PoolEvent::EniProvisioned {
            eni_id: eni_id.to_string(),
        });
        Ok(())
    }

    fn register_addresses(&mut self, eni_id: &str, addresses: &[EniAddress]) {
        for addr in addresses {
            if addr.primary {
                continue;
            }
            match self.datastore.register_ip(eni_id, addr.ip) {
                Ok(()) => {}
                Err(err) if err.is_duplicate() => {
                    debug!(eni = %eni_id, ip = %addr.ip, "address already registered");
                }
                Err(err) => {
                    warn!(eni = %eni_id, ip = %addr.ip, error = %err, "failed to register address");
                    self.emit(PoolEvent::IpRegistrationFailed {
                        eni_id: eni_id.to_string(),
                        ip: addr.ip,
                    });
                }
            }
        }
    }

    /// Poll instance metadata until the freshly attached ENI shows up.
    async fn wait_eni_attached(&self, eni_id: &str) -> Result<EniMetadata> {
        for attempt in 1..=self.config.max_eni_attach_checks {
            match self.metadata.attached_enis().await {
                Ok(enis) => {
                    if let Some(meta) = enis.into_iter().find(|meta| meta.eni_id == eni_id) {
                        return Ok(meta);
                    }
                    debug!(
                        eni = %eni_id,
                        attempt,
                        checks = self.config.max_eni_attach_checks,
                        "ENI not visible in metadata yet"
                    );
                }
                Err(err) => {
                    warn!(error = %err, attempt, "failed to list attached ENIs");
                }
            }
            sleep(self.config.eni_attach_wait()).await;
        }
        Err(Error::EniAttachTimeout(eni_id.to_string()))
    }

    fn emit(&self, event: PoolEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("pool event channel full; dropping event");
        }
    }

    /// Observed address capacity of the most recently enumerated ENI.
    pub fn current_max_addrs_per_eni(&self) -> usize {
        self.current_max_addrs_per_eni
    }

    /// High-water mark of the observed per-ENI address capacity.
    pub fn max_addrs_per_eni(&self) -> usize {
        self.max_addrs_per_eni
    }

    /// The attachment limit, once the cloud has revealed it.
    pub fn max_enis(&self) -> Option<usize> {
        self.max_enis
    }
}
