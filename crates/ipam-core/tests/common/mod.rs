//! Test doubles for pool-manager contract tests.
//!
//! The cloud double is scripted: tests enqueue per-call outcomes for
//! `allocate_eni` and canned address lists for `describe_eni`, and read
//! back call counters afterwards.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use ipam_core::error::{Error, Result};
use ipam_core::traits::{
    CloudApi, EniAddress, EniMetadata, HostNetwork, InstanceMetadata, LocalPod, NodeAgent,
};

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn cidr(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

pub fn eni_meta(eni_id: &str, device_number: u32) -> EniMetadata {
    EniMetadata {
        eni_id: eni_id.to_string(),
        mac: format!("02:e1:00:00:00:{device_number:02x}"),
        device_number,
        subnet_cidr: cidr("10.0.0.0/16"),
    }
}

/// Addresses for one ENI: a primary plus `secondaries` handout slots,
/// drawn from `10.0.<block>.0/24`.
pub fn eni_addresses(block: u8, secondaries: u8) -> Vec<EniAddress> {
    let mut addrs = vec![EniAddress {
        ip: Ipv4Addr::new(10, 0, block, 1),
        primary: true,
    }];
    for host in 0..secondaries {
        addrs.push(EniAddress {
            ip: Ipv4Addr::new(10, 0, block, 10 + host),
            primary: false,
        });
    }
    addrs
}

/// Outcome scripted for one `allocate_eni` call
pub enum AllocOutcome {
    Eni(String),
    AttachmentLimit,
    Transient(String),
}

pub struct MockCloud {
    primary_eni: String,
    local_ip: Ipv4Addr,
    vpc: Ipv4Net,
    alloc_script: Mutex<VecDeque<AllocOutcome>>,
    descriptions: Mutex<HashMap<String, Vec<EniAddress>>>,
    alloc_eni_calls: AtomicUsize,
    alloc_ip_calls: AtomicUsize,
    freed: Mutex<Vec<String>>,
}

impl MockCloud {
    pub fn new(primary_eni: &str) -> Arc<Self> {
        Arc::new(Self {
            primary_eni: primary_eni.to_string(),
            local_ip: ip("10.0.0.1"),
            vpc: cidr("10.0.0.0/16"),
            alloc_script: Mutex::new(VecDeque::new()),
            descriptions: Mutex::new(HashMap::new()),
            alloc_eni_calls: AtomicUsize::new(0),
            alloc_ip_calls: AtomicUsize::new(0),
            freed: Mutex::new(Vec::new()),
        })
    }

    pub fn script_alloc(&self, outcome: AllocOutcome) {
        self.alloc_script.lock().unwrap().push_back(outcome);
    }

    pub fn describe(&self, eni_id: &str, addresses: Vec<EniAddress>) {
        self.descriptions
            .lock()
            .unwrap()
            .insert(eni_id.to_string(), addresses);
    }

    pub fn alloc_eni_calls(&self) -> usize {
        self.alloc_eni_calls.load(Ordering::SeqCst)
    }

    pub fn alloc_ip_calls(&self) -> usize {
        self.alloc_ip_calls.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> Vec<String> {
        self.freed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn allocate_eni(&self) -> Result<String> {
        self.alloc_eni_calls.fetch_add(1, Ordering::SeqCst);
        match self.alloc_script.lock().unwrap().pop_front() {
            Some(AllocOutcome::Eni(id)) => Ok(id),
            Some(AllocOutcome::AttachmentLimit) => Err(Error::AttachmentLimitExceeded),
            Some(AllocOutcome::Transient(msg)) => Err(Error::cloud(msg)),
            None => Err(Error::cloud("unscripted allocate_eni call")),
        }
    }

    async fn allocate_all_ips(&self, _eni_id: &str) -> Result<()> {
        self.alloc_ip_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn describe_eni(&self, eni_id: &str) -> Result<Vec<EniAddress>> {
        self.descriptions
            .lock()
            .unwrap()
            .get(eni_id)
            .cloned()
            .ok_or_else(|| Error::cloud(format!("no description scripted for {eni_id}")))
    }

    async fn free_eni(&self, eni_id: &str) -> Result<()> {
        self.freed.lock().unwrap().push(eni_id.to_string());
        Ok(())
    }

    fn primary_eni_id(&self) -> &str {
        &self.primary_eni
    }

    fn local_ipv4(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn vpc_cidr(&self) -> Ipv4Net {
        self.vpc
    }
}

pub struct MockMetadata {
    enis: Mutex<Vec<EniMetadata>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockMetadata {
    pub fn new(enis: Vec<EniMetadata>) -> Arc<Self> {
        Arc::new(Self {
            enis: Mutex::new(enis),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn add(&self, meta: EniMetadata) {
        self.enis.lock().unwrap().push(meta);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceMetadata for MockMetadata {
    async fn attached_enis(&self) -> Result<Vec<EniMetadata>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::metadata("metadata service unavailable"));
        }
        Ok(self.enis.lock().unwrap().clone())
    }
}

pub struct MockNodeAgent {
    pods: Mutex<Vec<LocalPod>>,
    fail: AtomicBool,
}

impl MockNodeAgent {
    pub fn new(pods: Vec<LocalPod>) -> Arc<Self> {
        Arc::new(Self {
            pods: Mutex::new(pods),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeAgent for MockNodeAgent {
    async fn local_pods(&self, _local_ip: Ipv4Addr) -> Result<Vec<LocalPod>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::node_agent("kubelet not answering"));
        }
        Ok(self.pods.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockHostNetwork {
    host_setups: AtomicUsize,
    eni_setups: Mutex<Vec<(String, u32)>>,
}

impl MockHostNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn host_setups(&self) -> usize {
        self.host_setups.load(Ordering::SeqCst)
    }

    /// (mac, device number) pairs that were wired
    pub fn eni_setups(&self) -> Vec<(String, u32)> {
        self.eni_setups.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostNetwork for MockHostNetwork {
    async fn setup_host_network(&self, _vpc_cidr: Ipv4Net, _primary_ip: Ipv4Addr) -> Result<()> {
        self.host_setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn setup_eni_network(
        &self,
        _eni_primary_ip: Ipv4Addr,
        mac: &str,
        device_number: u32,
        _subnet_cidr: Ipv4Net,
    ) -> Result<()> {
        self.eni_setups
            .lock()
            .unwrap()
            .push((mac.to_string(), device_number));
        Ok(())
    }
}
