//! In-memory ENI/IP pool with pod assignment bookkeeping.
//!
//! Two-level model: the datastore owns ENI records, each ENI owns its
//! address slots, and a reverse index maps pod keys to their assigned
//! address. Pod bindings store only the IP literal plus the cached device
//! number, never a handle into the ENI, so teardown of an ENI has no
//! back-pointers to chase.
//!
//! All operations run under one reader/writer lock covering the whole
//! structure and are atomic with respect to each other. The counters
//! (`total`, `assigned`, per-ENI `assigned`) are maintained incrementally so
//! assign/release/free run in constant time; the redundancy is pinned by
//! the invariant tests in `tests/datastore_props.rs`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default minimum ENI age before teardown eligibility
pub const DEFAULT_MIN_ENI_LIFETIME: Duration = Duration::from_secs(60);

/// Default quiet time after the last address release before teardown eligibility
pub const DEFAULT_ADDRESS_COOLING: Duration = Duration::from_secs(60);

/// Identity of one pod instance on this node
///
/// Keys are composite: an empty component (the container id on the
/// rehydration path) is a literal empty string, not a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub name: String,
    pub namespace: String,
    pub container: String,
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(name {}, namespace {}, container {})",
            self.name, self.namespace, self.container
        )
    }
}

/// A pod's assigned address and the device number of the owning ENI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PodIpInfo {
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "DeviceNumber")]
    pub device_number: u32,
}

/// An assignment request from the RPC layer or startup rehydration
///
/// `ip` is set only during rehydration, when the node agent already knows
/// which address the pod holds.
#[derive(Debug, Clone)]
pub struct PodRequest {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub ip: Option<Ipv4Addr>,
}

impl PodRequest {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container: container.into(),
            ip: None,
        }
    }

    /// Rehydration variant carrying the address the pod is known to hold
    pub fn with_ip(
        name: impl Into<String>,
        namespace: impl Into<String>,
        container: impl Into<String>,
        ip: Ipv4Addr,
    ) -> Self {
        Self {
            ip: Some(ip),
            ..Self::new(name, namespace, container)
        }
    }

    fn key(&self) -> PodKey {
        PodKey {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            container: self.container.clone(),
        }
    }
}

/// Pool counters: registered addresses and assigned addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub assigned: usize,
}

impl PoolStats {
    /// Addresses registered but not handed to any pod
    pub fn free(&self) -> usize {
        self.total - self.assigned
    }
}

#[derive(Debug)]
struct AddressSlot {
    assigned: bool,
    unassigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Eni {
    device_number: u32,
    is_primary: bool,
    created_at: DateTime<Utc>,
    last_unassigned_at: Option<DateTime<Utc>>,
    assigned: usize,
    addresses: BTreeMap<Ipv4Addr, AddressSlot>,
}

impl Eni {
    fn is_full(&self) -> bool {
        self.assigned == self.addresses.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    total: usize,
    assigned: usize,
    enis: BTreeMap<String, Eni>,
    pods: HashMap<PodKey, PodIpInfo>,
}

/// Node-level ENI/IP datastore
#[derive(Debug)]
pub struct DataStore {
    inner: RwLock<Inner>,
    min_eni_lifetime: chrono::Duration,
    address_cooling: chrono::Duration,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    /// Create a datastore with the default teardown safety windows.
    pub fn new() -> Self {
        Self::with_windows(DEFAULT_MIN_ENI_LIFETIME, DEFAULT_ADDRESS_COOLING)
    }

    /// Create a datastore with explicit teardown safety windows.
    pub fn with_windows(min_eni_lifetime: Duration, address_cooling: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            min_eni_lifetime: chrono::Duration::from_std(min_eni_lifetime)
                .unwrap_or(chrono::Duration::MAX),
            address_cooling: chrono::Duration::from_std(address_cooling)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly attached ENI.
    ///
    /// `DuplicateEni` is benign on the rediscovery path; any other failure
    /// aborts the caller's current reconciliation step.
    pub fn register_eni(&self, eni_id: &str, device_number: u32, is_primary: bool) -> Result<()> {
        let mut inner = self.write();
        if inner.enis.contains_key(eni_id) {
            return Err(Error::DuplicateEni(eni_id.to_string()));
        }
        debug!(eni = %eni_id, device = device_number, primary = is_primary, "registering ENI");
        inner.enis.insert(
            eni_id.to_string(),
            Eni {
                device_number,
                is_primary,
                created_at: Utc::now(),
                last_unassigned_at: None,
                assigned: 0,
                addresses: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Register a secondary address on an ENI.
    ///
    /// Addresses are unique across the node, not just per ENI; the cloud
    /// guarantees this, and the check here catches caller bugs cheaply.
    pub fn register_ip(&self, eni_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut inner = self.write();
        if !inner.enis.contains_key(eni_id) {
            return Err(Error::UnknownEni(eni_id.to_string()));
        }
        if let Some((owner, _)) = inner
            .enis
            .iter()
            .find(|(_, eni)| eni.addresses.contains_key(&ip))
        {
            return Err(Error::DuplicateIp {
                eni_id: owner.clone(),
                ip,
            });
        }
        let Some(eni) = inner.enis.get_mut(eni_id) else {
            return Err(Error::UnknownEni(eni_id.to_string()));
        };
        eni.addresses.insert(
            ip,
            AddressSlot {
                assigned: false,
                unassigned_at: None,
            },
        );
        inner.total += 1;
        info!(eni = %eni_id, %ip, total = inner.total, "registered address");
        Ok(())
    }

    /// Assign an address to a pod.
    ///
    /// Returns the address and the owning ENI's device number. Re-assigning
    /// the same pod key is idempotent as long as the requested address (if
    /// any) matches the existing binding; a mismatch is a caller bug and is
    /// refused with `InconsistentPodIp`.
    pub fn assign(&self, request: &PodRequest) -> Result<(Ipv4Addr, u32)> {
        let mut guard = self.write();
        let inner = &mut *guard;
        let key = request.key();

        if let Some(existing) = inner.pods.get(&key) {
            return match request.ip {
                Some(requested) if requested != existing.ip => {
                    warn!(
                        pod = %key,
                        existing = %existing.ip,
                        requested = %requested,
                        "pod claims a second address; refusing"
                    );
                    Err(Error::InconsistentPodIp {
                        pod: key.to_string(),
                        existing: existing.ip,
                        requested,
                    })
                }
                _ => {
                    debug!(pod = %key, ip = %existing.ip, "duplicate assign; returning existing binding");
                    Ok((existing.ip, existing.device_number))
                }
            };
        }

        for (eni_id, eni) in inner.enis.iter_mut() {
            if request.ip.is_none() && eni.is_full() {
                debug!(eni = %eni_id, "skipping ENI with no free addresses");
                continue;
            }
            let device_number = eni.device_number;
            for (addr, slot) in eni.addresses.iter_mut() {
                let wanted = match request.ip {
                    Some(requested) => requested == *addr,
                    None => !slot.assigned,
                };
                if !wanted {
                    continue;
                }
                // A requested address that is already assigned still takes
                // the binding: rehydration and the RPC path may use
                // different container components for the same pod.
                if !slot.assigned {
                    slot.assigned = true;
                    eni.assigned += 1;
                    inner.assigned += 1;
                }
                let ip = *addr;
                inner.pods.insert(key.clone(), PodIpInfo { ip, device_number });
                info!(pod = %key, %ip, device = device_number, "assigned address");
                return Ok((ip, device_number));
            }
        }

        info!(pod = %key, "no available IP addresses");
        Err(Error::NoAddressAvailable)
    }

    /// Release a pod's address back to the warm pool.
    ///
    /// Returns the address and device number so the caller can tear down
    /// the pod's network. Stamps the cooling-period clock on both the
    /// address and its ENI.
    pub fn release(&self, key: &PodKey) -> Result<(Ipv4Addr, u32)> {
        let mut guard = self.write();
        let inner = &mut *guard;

        let Some(binding) = inner.pods.get(key).copied() else {
            warn!(pod = %key, "release for unknown pod");
            return Err(Error::UnknownPod);
        };

        for eni in inner.enis.values_mut() {
            let device_number = eni.device_number;
            if let Some(slot) = eni.addresses.get_mut(&binding.ip) {
                if !slot.assigned {
                    continue;
                }
                slot.assigned = false;
                eni.assigned -= 1;
                inner.assigned -= 1;
                let now = Utc::now();
                slot.unassigned_at = Some(now);
                eni.last_unassigned_at = Some(now);
                inner.pods.remove(key);
                info!(pod = %key, ip = %binding.ip, device = device_number, "released address");
                return Ok((binding.ip, device_number));
            }
        }

        warn!(pod = %key, ip = %binding.ip, "pod bound to an address the datastore does not hold");
        Err(Error::UnknownPodIp)
    }

    /// Id of an ENI currently eligible for teardown, if any.
    ///
    /// Eligible means: not primary, older than the minimum lifetime, quiet
    /// for at least the cooling period, and carrying zero assigned
    /// addresses. Selection is deterministic (first eligible by ENI id).
    pub fn select_deletable_eni(&self) -> Option<String> {
        let inner = self.read();
        self.deletable_eni(&inner.enis, Utc::now())
    }

    /// Remove a teardown-eligible ENI from the datastore.
    ///
    /// On success the datastore has already forgotten the ENI and its
    /// addresses; the caller owns the subsequent cloud-side release.
    pub fn free_eni(&self) -> Result<String> {
        let mut inner = self.write();
        let now = Utc::now();
        let Some(eni_id) = self.deletable_eni(&inner.enis, now) else {
            debug!("no ENI can be deleted at this time");
            return Err(Error::NoDeletableEni);
        };
        let Some(eni) = inner.enis.remove(&eni_id) else {
            return Err(Error::NoDeletableEni);
        };
        inner.total -= eni.addresses.len();
        inner.assigned -= eni.assigned;
        info!(
            eni = %eni_id,
            freed = eni.addresses.len(),
            total = inner.total,
            assigned = inner.assigned,
            "removed ENI from datastore"
        );
        Ok(eni_id)
    }

    fn deletable_eni(&self, enis: &BTreeMap<String, Eni>, now: DateTime<Utc>) -> Option<String> {
        enis.iter().find_map(|(id, eni)| {
            if eni.is_primary {
                return None;
            }
            if now.signed_duration_since(eni.created_at) < self.min_eni_lifetime {
                return None;
            }
            if let Some(last) = eni.last_unassigned_at {
                if now.signed_duration_since(last) < self.address_cooling {
                    return None;
                }
            }
            if eni.assigned != 0 {
                return None;
            }
            Some(id.clone())
        })
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.read();
        PoolStats {
            total: inner.total,
            assigned: inner.assigned,
        }
    }

    /// Number of registered ENIs.
    pub fn eni_count(&self) -> usize {
        self.read().enis.len()
    }

    /// Deep copy of the ENI pools for the introspection endpoint.
    pub fn snapshot_enis(&self) -> EniSnapshot {
        let inner = self.read();
        EniSnapshot {
            total_ips: inner.total,
            assigned_ips: inner.assigned,
            pools: inner
                .enis
                .iter()
                .map(|(id, eni)| {
                    (
                        id.clone(),
                        EniPoolSnapshot {
                            is_primary: eni.is_primary,
                            device_number: eni.device_number,
                            assigned: eni.assigned,
                            addresses: eni
                                .addresses
                                .iter()
                                .map(|(ip, slot)| {
                                    (
                                        ip.to_string(),
                                        AddressSnapshot {
                                            assigned: slot.assigned,
                                        },
                                    )
                                })
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Deep copy of the pod bindings, keyed `name_namespace_container`.
    pub fn snapshot_pods(&self) -> BTreeMap<String, PodIpInfo> {
        let inner = self.read();
        inner
            .pods
            .iter()
            .map(|(key, info)| {
                (
                    format!("{}_{}_{}", key.name, key.namespace, key.container),
                    *info,
                )
            })
            .collect()
    }
}

/// Introspection view of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct EniSnapshot {
    #[serde(rename = "TotalIPs")]
    pub total_ips: usize,
    #[serde(rename = "AssignedIPs")]
    pub assigned_ips: usize,
    #[serde(rename = "ENIIPPools")]
    pub pools: BTreeMap<String, EniPoolSnapshot>,
}

/// Introspection view of one ENI
#[derive(Debug, Clone, Serialize)]
pub struct EniPoolSnapshot {
    #[serde(rename = "IsPrimary")]
    pub is_primary: bool,
    #[serde(rename = "DeviceNumber")]
    pub device_number: u32,
    #[serde(rename = "AssignedIPv4Addresses")]
    pub assigned: usize,
    #[serde(rename = "IPv4Addresses")]
    pub addresses: BTreeMap<String, AddressSnapshot>,
}

/// Introspection view of one address slot
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AddressSnapshot {
    #[serde(rename = "Assigned")]
    pub assigned: bool,
}
