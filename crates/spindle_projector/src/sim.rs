//! Simulated kv cluster and upstream feeder.
//!
//! Stands in for the real change-stream protocol in tests and local load
//! runs: stream requests are answered with Success (or a scripted rollback),
//! and tests inject mutations through the factory registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use spindle_common::ts::FailoverLog;
use spindle_common::{Error, Seqno, Vbno, Vbuuid};
use tokio::sync::mpsc;

use crate::endpoint::{DataportPayload, EndpointFactory, RouterEndpoint};
use crate::events::UprEvent;
use crate::projector::{BucketFeeder, FeederFactory, KvCluster};

/// Capacity of each simulated upstream event channel.
const SIM_STREAM_CAPACITY: usize = 4096;

/// Base vbuuid assigned to vbucket histories.
const SIM_VBUUID_BASE: Vbuuid = 1_000;

/// Fixed vbucket map: the vbucket space divided contiguously across a set
/// of kv-node addresses.
pub struct SimCluster {
    kvaddrs: Vec<String>,
    max_vbuckets: usize,
}

impl SimCluster {
    pub fn new(kvaddrs: Vec<String>, max_vbuckets: usize) -> Arc<Self> {
        Arc::new(Self {
            kvaddrs,
            max_vbuckets,
        })
    }

    pub fn kvaddr_for(&self, vbno: Vbno) -> &str {
        let per_node = self.max_vbuckets.div_ceil(self.kvaddrs.len());
        &self.kvaddrs[(vbno as usize / per_node).min(self.kvaddrs.len() - 1)]
    }

    pub fn vbuuid_for(&self, vbno: Vbno) -> Vbuuid {
        SIM_VBUUID_BASE + vbno as Vbuuid
    }

    pub fn failover_log_for(&self, vbno: Vbno) -> FailoverLog {
        FailoverLog(vec![(self.vbuuid_for(vbno), 0)])
    }
}

impl KvCluster for SimCluster {
    fn vbmap(
        &self,
        _pool: &str,
        _bucket: &str,
        kvaddrs: &[String],
    ) -> Result<BTreeMap<String, Vec<Vbno>>, Error> {
        let mut map: BTreeMap<String, Vec<Vbno>> = BTreeMap::new();
        for vbno in 0..self.max_vbuckets as Vbno {
            let kvaddr = self.kvaddr_for(vbno);
            if kvaddrs.is_empty() || kvaddrs.iter().any(|a| a == kvaddr) {
                map.entry(kvaddr.to_string()).or_default().push(vbno);
            }
        }
        Ok(map)
    }

    fn failover_logs(
        &self,
        _pool: &str,
        _bucket: &str,
        vbnos: &[Vbno],
    ) -> Result<BTreeMap<Vbno, FailoverLog>, Error> {
        Ok(vbnos
            .iter()
            .map(|&vbno| (vbno, self.failover_log_for(vbno)))
            .collect())
    }
}

/// Feeder factory keeping a registry of open streams so tests can inject
/// mutations and script rollbacks.
pub struct SimFeederFactory {
    cluster: Arc<SimCluster>,
    rollbacks: Arc<Mutex<BTreeMap<(String, Vbno), Seqno>>>,
    senders: Mutex<BTreeMap<(String, String), mpsc::Sender<UprEvent>>>,
}

impl SimFeederFactory {
    pub fn new(cluster: Arc<SimCluster>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            rollbacks: Arc::new(Mutex::new(BTreeMap::new())),
            senders: Mutex::new(BTreeMap::new()),
        })
    }

    /// Script the next stream request for (bucket, vbno) to answer Rollback.
    pub fn script_rollback(&self, bucket: &str, vbno: Vbno, rollback_seqno: Seqno) {
        self.rollbacks
            .lock()
            .unwrap()
            .insert((bucket.to_string(), vbno), rollback_seqno);
    }

    pub fn clear_rollback(&self, bucket: &str, vbno: Vbno) {
        self.rollbacks
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), vbno));
    }

    /// Inject an upstream event for the kv-node serving `event.vbno`.
    /// Returns false when no stream is open for that node.
    pub fn emit(&self, bucket: &str, event: UprEvent) -> bool {
        let kvaddr = self.cluster.kvaddr_for(event.vbno).to_string();
        let senders = self.senders.lock().unwrap();
        match senders.get(&(bucket.to_string(), kvaddr)) {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }
}

impl FeederFactory for SimFeederFactory {
    fn open(
        &self,
        _topic: &str,
        bucket: &str,
        kvaddr: &str,
    ) -> Result<(Box<dyn BucketFeeder>, mpsc::Receiver<UprEvent>), Error> {
        let (tx, rx) = mpsc::channel(SIM_STREAM_CAPACITY);
        self.senders
            .lock()
            .unwrap()
            .insert((bucket.to_string(), kvaddr.to_string()), tx.clone());
        let feeder = SimFeeder {
            bucket: bucket.to_string(),
            cluster: self.cluster.clone(),
            rollbacks: self.rollbacks.clone(),
            tx: Mutex::new(Some(tx)),
        };
        Ok((Box::new(feeder), rx))
    }
}

struct SimFeeder {
    bucket: String,
    cluster: Arc<SimCluster>,
    rollbacks: Arc<Mutex<BTreeMap<(String, Vbno), Seqno>>>,
    tx: Mutex<Option<mpsc::Sender<UprEvent>>>,
}

impl SimFeeder {
    fn send(&self, event: UprEvent) -> Result<(), Error> {
        let tx = self.tx.lock().unwrap();
        let tx = tx.as_ref().ok_or(Error::Feeder(self.bucket.clone()))?;
        tx.try_send(event)
            .map_err(|_| Error::Feeder(self.bucket.clone()))
    }
}

impl BucketFeeder for SimFeeder {
    fn start_stream(
        &self,
        vbno: Vbno,
        _vbuuid: Vbuuid,
        _seqno: Seqno,
        _snap_start: Seqno,
        _snap_end: Seqno,
    ) -> Result<(), Error> {
        let rollback = self
            .rollbacks
            .lock()
            .unwrap()
            .get(&(self.bucket.clone(), vbno))
            .copied();
        let event = match rollback {
            Some(rollback_seqno) => UprEvent::stream_request_rollback(vbno, rollback_seqno),
            None => UprEvent::stream_request(vbno, self.cluster.failover_log_for(vbno)),
        };
        self.send(event)
    }

    fn end_stream(&self, vbno: Vbno) -> Result<(), Error> {
        self.send(UprEvent::stream_end(vbno))
    }

    fn close(&self) -> Result<(), Error> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}

/// Endpoint factory that drains every opened endpoint into a shared,
/// inspectable payload log.
pub struct CollectorFactory {
    collected: Arc<Mutex<BTreeMap<String, Vec<DataportPayload>>>>,
}

impl CollectorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collected: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    /// Snapshot of everything delivered to `raddr` so far.
    pub fn payloads(&self, raddr: &str) -> Vec<DataportPayload> {
        self.collected
            .lock()
            .unwrap()
            .get(raddr)
            .cloned()
            .unwrap_or_default()
    }
}

impl EndpointFactory for CollectorFactory {
    fn open(&self, _topic: &str, raddr: &str) -> Result<RouterEndpoint, Error> {
        let (endpoint, mut rx) = RouterEndpoint::pair(raddr);
        let collected = self.collected.clone();
        let raddr = raddr.to_string();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                collected
                    .lock()
                    .unwrap()
                    .entry(raddr.clone())
                    .or_default()
                    .push(payload);
            }
        });
        Ok(endpoint)
    }
}
