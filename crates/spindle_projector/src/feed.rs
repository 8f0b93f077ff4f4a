//! Feed: aggregates the kv data paths for one topic.
//!
//! Every topic-mutating operation is idempotent: the caller sends the full
//! requested set, the feed computes the delta against current state and
//! applies only that. Vbuckets already active or with an outstanding stream
//! request are silently skipped; vbuckets that must rewind are reported in
//! the response rollback timestamps, never as an operation error.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use spindle_common::stats::statistics;
use spindle_common::ts::{TsEntry, TsVbuuid};
use spindle_common::{Config, Error, Statistics, Vbno};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::endpoint::{EndpointFactory, RouterEndpoint};
use crate::engine::{Engine, Instance};
use crate::events::StreamStatus;
use crate::kvdata::{FeedBack, KvData};
use crate::projector::{BucketFeeder, FeederFactory, KvCluster};

/// Returned by every topic-mutating operation regardless of error: the
/// currently-streaming vbuckets per bucket, the vbuckets that must be rolled
/// back, and the embedded error kind if the operation failed partway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicResponse {
    pub topic: String,
    pub active_timestamps: Vec<TsVbuuid>,
    pub rollback_timestamps: Vec<TsVbuuid>,
    pub err: Option<Error>,
}

enum FeedCommand {
    MutationTopic {
        endpoint_type: String,
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
        reply: oneshot::Sender<TopicResponse>,
    },
    RestartVbuckets {
        restart_ts: Vec<TsVbuuid>,
        reply: oneshot::Sender<TopicResponse>,
    },
    ShutdownVbuckets {
        shutdown_ts: Vec<TsVbuuid>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    AddBuckets {
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
        reply: oneshot::Sender<TopicResponse>,
    },
    DelBuckets {
        buckets: Vec<String>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    AddInstances {
        instances: Vec<Instance>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    DelInstances {
        uuids: Vec<u64>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RepairEndpoints {
        endpoints: Vec<String>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetStatistics {
        reply: oneshot::Sender<Statistics>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running feed task.
#[derive(Clone)]
pub struct Feed {
    topic: String,
    reqch: mpsc::Sender<FeedCommand>,
}

impl Feed {
    pub fn new(
        topic: &str,
        config: Config,
        cluster: std::sync::Arc<dyn KvCluster>,
        feeders: std::sync::Arc<dyn FeederFactory>,
        endpoint_factory: std::sync::Arc<dyn EndpointFactory>,
    ) -> Self {
        let (reqch, reqch_rx) = mpsc::channel(16);
        let (backch_tx, backch_rx) = mpsc::unbounded_channel();
        let server = FeedServer {
            topic: topic.to_string(),
            endpoint_type: String::new(),
            config,
            cluster,
            feeders,
            endpoint_factory,
            engines: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            req_ts: BTreeMap::new(),
            act_ts: BTreeMap::new(),
            roll_ts: BTreeMap::new(),
            outstanding: BTreeMap::new(),
            assignments: BTreeMap::new(),
            kvdata: BTreeMap::new(),
            backch_tx,
        };
        tokio::spawn(server.run(reqch_rx, backch_rx));
        tracing::info!(topic, "feed started");
        Self {
            topic: topic.to_string(),
            reqch,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn mutation_topic(
        &self,
        endpoint_type: &str,
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(
            FeedCommand::MutationTopic {
                endpoint_type: endpoint_type.to_string(),
                req_ts,
                instances,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn restart_vbuckets(
        &self,
        restart_ts: Vec<TsVbuuid>,
    ) -> Result<TopicResponse, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::RestartVbuckets { restart_ts, reply }, rx)
            .await
    }

    pub async fn shutdown_vbuckets(&self, shutdown_ts: Vec<TsVbuuid>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::ShutdownVbuckets { shutdown_ts, reply }, rx)
            .await?
    }

    pub async fn add_buckets(
        &self,
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(
            FeedCommand::AddBuckets {
                req_ts,
                instances,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn del_buckets(&self, buckets: Vec<String>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::DelBuckets { buckets, reply }, rx)
            .await?
    }

    pub async fn add_instances(&self, instances: Vec<Instance>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::AddInstances { instances, reply }, rx)
            .await?
    }

    pub async fn del_instances(&self, uuids: Vec<u64>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::DelInstances { uuids, reply }, rx)
            .await?
    }

    pub async fn repair_endpoints(&self, endpoints: Vec<String>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::RepairEndpoints { endpoints, reply }, rx)
            .await?
    }

    pub async fn get_statistics(&self) -> Result<Statistics, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::GetStatistics { reply }, rx).await
    }

    /// Stop the feed and every data path under it.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(FeedCommand::Shutdown { reply }, rx).await
    }

    async fn call<T>(&self, cmd: FeedCommand, rx: oneshot::Receiver<T>) -> Result<T, Error> {
        self.reqch.send(cmd).await.map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }
}

struct KvDataEntry {
    kvdata: KvData,
    feeder: Box<dyn BucketFeeder>,
}

enum Waited {
    Started(String, Vbno),
    Ended(String, Vbno),
}

struct FeedServer {
    topic: String,
    endpoint_type: String,
    config: Config,
    cluster: std::sync::Arc<dyn KvCluster>,
    feeders: std::sync::Arc<dyn FeederFactory>,
    endpoint_factory: std::sync::Arc<dyn EndpointFactory>,
    /// Per bucket: instance uuid -> engine.
    engines: BTreeMap<String, BTreeMap<u64, Engine>>,
    endpoints: BTreeMap<String, RouterEndpoint>,
    /// Cumulative requested positions per bucket.
    req_ts: BTreeMap<String, TsVbuuid>,
    /// Currently-streaming vbuckets per bucket.
    act_ts: BTreeMap<String, TsVbuuid>,
    /// Vbuckets that must rewind, with their rollback seqno.
    roll_ts: BTreeMap<String, TsVbuuid>,
    /// Vbuckets with an outstanding stream request.
    outstanding: BTreeMap<String, BTreeSet<Vbno>>,
    /// Which kv-node serves each requested vbucket.
    assignments: BTreeMap<String, BTreeMap<Vbno, String>>,
    kvdata: BTreeMap<(String, String), KvDataEntry>,
    backch_tx: mpsc::UnboundedSender<FeedBack>,
}

impl FeedServer {
    async fn run(
        mut self,
        mut reqch: mpsc::Receiver<FeedCommand>,
        mut backch: mpsc::UnboundedReceiver<FeedBack>,
    ) {
        loop {
            tokio::select! {
                cmd = reqch.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd, &mut backch).await {
                            break;
                        }
                    }
                    None => break,
                },
                fb = backch.recv() => {
                    if let Some(fb) = fb {
                        self.handle_feedback(fb);
                    }
                }
            }
        }
        self.close_all().await;
        tracing::info!(topic = %self.topic, "feed stopped");
    }

    /// Returns true on Shutdown.
    async fn handle_command(
        &mut self,
        cmd: FeedCommand,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
    ) -> bool {
        match cmd {
            FeedCommand::MutationTopic {
                endpoint_type,
                req_ts,
                instances,
                reply,
            } => {
                self.endpoint_type = endpoint_type;
                let resp = self.start_topic(req_ts, instances, backch).await;
                let _ = reply.send(resp);
                false
            }
            FeedCommand::AddBuckets {
                req_ts,
                instances,
                reply,
            } => {
                let resp = self.start_topic(req_ts, instances, backch).await;
                let _ = reply.send(resp);
                false
            }
            FeedCommand::RestartVbuckets { restart_ts, reply } => {
                let resp = self.restart_vbuckets(restart_ts, backch).await;
                let _ = reply.send(resp);
                false
            }
            FeedCommand::ShutdownVbuckets { shutdown_ts, reply } => {
                let result = self.shutdown_vbuckets(shutdown_ts, backch).await;
                let _ = reply.send(result);
                false
            }
            FeedCommand::DelBuckets { buckets, reply } => {
                let result = self.del_buckets(buckets).await;
                let _ = reply.send(result);
                false
            }
            FeedCommand::AddInstances { instances, reply } => {
                let result = self.add_instances(instances, true).await;
                let _ = reply.send(result);
                false
            }
            FeedCommand::DelInstances { uuids, reply } => {
                let result = self.del_instances(uuids).await;
                let _ = reply.send(result);
                false
            }
            FeedCommand::RepairEndpoints { endpoints, reply } => {
                let result = self.repair_endpoints(endpoints).await;
                let _ = reply.send(result);
                false
            }
            FeedCommand::GetStatistics { reply } => {
                let _ = reply.send(self.get_statistics().await);
                false
            }
            FeedCommand::Shutdown { reply } => {
                let _ = reply.send(());
                true
            }
        }
    }

    /// MutationTopic / AddBuckets: add instances, then stream the delta of
    /// every requested timestamp.
    async fn start_topic(
        &mut self,
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
    ) -> TopicResponse {
        let mut err = self.add_instances(instances, false).await.err();

        let mut waiting: BTreeMap<String, BTreeSet<Vbno>> = BTreeMap::new();
        for ts in req_ts {
            let bucket = ts.bucket.clone();
            if self.engines.get(&bucket).map_or(true, |e| e.is_empty()) {
                tracing::error!(topic = %self.topic, bucket, "bucket has no instance");
                err.get_or_insert(Error::InconsistentFeed);
                continue;
            }
            match self.start_bucket_streams(&bucket, &ts).await {
                Ok(requested) => {
                    waiting.entry(bucket).or_default().extend(requested);
                }
                Err(e) => {
                    tracing::error!(
                        topic = %self.topic,
                        bucket,
                        error = %e,
                        "failed to start bucket streams"
                    );
                    err.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.wait_started(&mut waiting, backch).await {
            err.get_or_insert(e);
        }
        self.topic_response(err)
    }

    async fn restart_vbuckets(
        &mut self,
        restart_ts: Vec<TsVbuuid>,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
    ) -> TopicResponse {
        let mut err = None;
        let mut waiting: BTreeMap<String, BTreeSet<Vbno>> = BTreeMap::new();
        for ts in restart_ts {
            let bucket = ts.bucket.clone();
            if self.engines.get(&bucket).map_or(true, |e| e.is_empty()) {
                err.get_or_insert(Error::InvalidBucket(bucket.clone()));
                continue;
            }
            match self.start_bucket_streams(&bucket, &ts).await {
                Ok(requested) => {
                    waiting.entry(bucket).or_default().extend(requested);
                }
                Err(e) => {
                    err.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.wait_started(&mut waiting, backch).await {
            err.get_or_insert(e);
        }
        self.topic_response(err)
    }

    async fn shutdown_vbuckets(
        &mut self,
        shutdown_ts: Vec<TsVbuuid>,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
    ) -> Result<(), Error> {
        let mut waiting: BTreeMap<String, BTreeSet<Vbno>> = BTreeMap::new();
        for ts in shutdown_ts {
            let bucket = ts.bucket.clone();
            if !self.req_ts.contains_key(&bucket) {
                return Err(Error::InvalidBucket(bucket));
            }
            for vbno in ts.vbnos() {
                let active = self
                    .act_ts
                    .get(&bucket)
                    .map_or(false, |act| act.contains(vbno));
                if !active {
                    continue;
                }
                let Some(kvaddr) = self
                    .assignments
                    .get(&bucket)
                    .and_then(|a| a.get(&vbno))
                    .cloned()
                else {
                    continue;
                };
                if let Some(entry) = self.kvdata.get(&(bucket.clone(), kvaddr)) {
                    entry.feeder.end_stream(vbno)?;
                    waiting.entry(bucket.clone()).or_default().insert(vbno);
                }
            }
        }
        self.wait_ended(&mut waiting, backch).await
    }

    async fn del_buckets(&mut self, buckets: Vec<String>) -> Result<(), Error> {
        for bucket in buckets {
            let keys: Vec<(String, String)> = self
                .kvdata
                .keys()
                .filter(|(b, _)| *b == bucket)
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = self.kvdata.remove(&key) {
                    let _ = entry.feeder.close();
                    let _ = entry.kvdata.close().await;
                }
            }
            self.engines.remove(&bucket);
            self.req_ts.remove(&bucket);
            self.act_ts.remove(&bucket);
            self.roll_ts.remove(&bucket);
            self.outstanding.remove(&bucket);
            self.assignments.remove(&bucket);
        }
        Ok(())
    }

    /// Add engines for the given instances and open their endpoints lazily.
    /// With `require_bucket`, instances for buckets not already part of the
    /// feed are rejected (the public AddInstances contract).
    async fn add_instances(
        &mut self,
        instances: Vec<Instance>,
        require_bucket: bool,
    ) -> Result<(), Error> {
        for instance in &instances {
            if instance.bucket.is_empty() {
                return Err(Error::InconsistentFeed);
            }
            if require_bucket && !self.engines.contains_key(&instance.bucket) {
                return Err(Error::InconsistentFeed);
            }
        }
        let mut touched = BTreeSet::new();
        for instance in instances {
            for raddr in &instance.endpoints {
                if !self.endpoints.contains_key(raddr) {
                    let endpoint = self.endpoint_factory.open(&self.topic, raddr)?;
                    self.endpoints.insert(raddr.clone(), endpoint);
                }
            }
            touched.insert(instance.bucket.clone());
            self.engines
                .entry(instance.bucket.clone())
                .or_default()
                .insert(instance.uuid, instance.to_engine());
        }
        for bucket in touched {
            self.push_engines(&bucket).await;
        }
        Ok(())
    }

    async fn del_instances(&mut self, uuids: Vec<u64>) -> Result<(), Error> {
        // Deleting the last engine of a bucket requires DelBuckets.
        for (bucket, engines) in &self.engines {
            let remaining = engines.keys().filter(|uuid| !uuids.contains(uuid)).count();
            if remaining == 0 && !engines.is_empty() {
                tracing::error!(
                    topic = %self.topic,
                    bucket,
                    "cannot delete the last instance of a bucket"
                );
                return Err(Error::InconsistentFeed);
            }
        }
        for engines in self.engines.values_mut() {
            for uuid in &uuids {
                engines.remove(uuid);
            }
        }
        for entry in self.kvdata.values() {
            let _ = entry.kvdata.delete_engines(uuids.clone()).await;
        }
        Ok(())
    }

    async fn repair_endpoints(&mut self, raddrs: Vec<String>) -> Result<(), Error> {
        for raddr in raddrs {
            if self.endpoints.contains_key(&raddr) {
                let endpoint = self.endpoint_factory.open(&self.topic, &raddr)?;
                self.endpoints.insert(raddr, endpoint);
            }
        }
        let buckets: Vec<String> = self.engines.keys().cloned().collect();
        for bucket in buckets {
            self.push_engines(&bucket).await;
        }
        Ok(())
    }

    async fn get_statistics(&self) -> Statistics {
        let mut stats = statistics([("topic", json!(self.topic))]);
        for ((bucket, kvaddr), entry) in &self.kvdata {
            if let Ok(kv_stats) = entry.kvdata.get_statistics().await {
                stats.insert(format!("{bucket}/{kvaddr}"), json!(kv_stats));
            }
        }
        stats
    }

    /// Push the current engine and endpoint maps down to every data path of
    /// `bucket`.
    async fn push_engines(&self, bucket: &str) {
        let Some(engines) = self.engines.get(bucket) else {
            return;
        };
        for ((b, _), entry) in &self.kvdata {
            if b == bucket {
                let _ = entry
                    .kvdata
                    .add_engines(engines.clone(), self.endpoints.clone())
                    .await;
            }
        }
    }

    /// Cross the requested timestamp with the vbmap, create or update the
    /// data path per kv-node, and issue stream requests for the vbuckets
    /// that are neither active nor outstanding. Returns the requested set.
    async fn start_bucket_streams(
        &mut self,
        bucket: &str,
        ts: &TsVbuuid,
    ) -> Result<Vec<Vbno>, Error> {
        let mut want: Vec<Vbno> = Vec::new();
        for vbno in ts.vbnos() {
            let active = self
                .act_ts
                .get(bucket)
                .map_or(false, |act| act.contains(vbno));
            let outstanding = self
                .outstanding
                .get(bucket)
                .map_or(false, |out| out.contains(&vbno));
            if !active && !outstanding {
                want.push(vbno);
            }
        }
        if want.is_empty() {
            return Ok(want);
        }

        let delta = ts.filter_vbuckets(&want);
        self.req_ts
            .entry(bucket.to_string())
            .and_modify(|cur| *cur = cur.union(&delta))
            .or_insert_with(|| delta.clone());

        let vbmap = self.cluster.vbmap(&ts.pool, bucket, &[])?;
        let mut requested = Vec::new();
        for (kvaddr, vbnos) in vbmap {
            let local: Vec<Vbno> = vbnos
                .iter()
                .copied()
                .filter(|vbno| delta.contains(*vbno))
                .collect();
            if local.is_empty() {
                continue;
            }
            let sub_ts = delta.filter_vbuckets(&local);
            self.ensure_kvdata(bucket, &kvaddr, &sub_ts)?;
            let Some(entry) = self.kvdata.get(&(bucket.to_string(), kvaddr.clone())) else {
                continue;
            };
            entry.kvdata.update_ts(sub_ts.clone()).await?;
            for vbno in local {
                let e = sub_ts.get(vbno).copied().unwrap_or_default();
                entry
                    .feeder
                    .start_stream(vbno, e.vbuuid, e.seqno, e.snap_start, e.snap_end)?;
                self.outstanding
                    .entry(bucket.to_string())
                    .or_default()
                    .insert(vbno);
                self.roll_ts.entry(bucket.to_string()).and_modify(|roll| {
                    roll.remove(vbno);
                });
                self.assignments
                    .entry(bucket.to_string())
                    .or_default()
                    .insert(vbno, kvaddr.clone());
                requested.push(vbno);
            }
        }
        Ok(requested)
    }

    fn ensure_kvdata(&mut self, bucket: &str, kvaddr: &str, seed_ts: &TsVbuuid) -> Result<(), Error> {
        let key = (bucket.to_string(), kvaddr.to_string());
        if self.kvdata.contains_key(&key) {
            return Ok(());
        }
        let (feeder, mutch) = self.feeders.open(&self.topic, bucket, kvaddr)?;
        let kvdata = KvData::new(
            &self.topic,
            bucket,
            kvaddr,
            seed_ts.clone(),
            self.engines.get(bucket).cloned().unwrap_or_default(),
            self.endpoints.clone(),
            mutch,
            self.backch_tx.clone(),
        );
        self.kvdata.insert(key, KvDataEntry { kvdata, feeder });
        Ok(())
    }

    /// Drain the back-channel until every awaited stream request has been
    /// answered, bounded by the response timeout.
    async fn wait_started(
        &mut self,
        waiting: &mut BTreeMap<String, BTreeSet<Vbno>>,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
    ) -> Result<(), Error> {
        self.wait_for(waiting, backch, true).await
    }

    async fn wait_ended(
        &mut self,
        waiting: &mut BTreeMap<String, BTreeSet<Vbno>>,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
    ) -> Result<(), Error> {
        self.wait_for(waiting, backch, false).await
    }

    async fn wait_for(
        &mut self,
        waiting: &mut BTreeMap<String, BTreeSet<Vbno>>,
        backch: &mut mpsc::UnboundedReceiver<FeedBack>,
        started: bool,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + Duration::from_millis(self.config.response_timeout_ms);
        loop {
            waiting.retain(|_, vbnos| !vbnos.is_empty());
            if waiting.is_empty() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ResponseTimeout);
            }
            match tokio::time::timeout(remaining, backch.recv()).await {
                Ok(Some(fb)) => match (started, self.handle_feedback(fb)) {
                    (true, Some(Waited::Started(bucket, vbno)))
                    | (false, Some(Waited::Ended(bucket, vbno))) => {
                        if let Some(vbnos) = waiting.get_mut(&bucket) {
                            vbnos.remove(&vbno);
                        }
                    }
                    _ => {}
                },
                Ok(None) => return Ok(()),
                Err(_) => return Err(Error::ResponseTimeout),
            }
        }
    }

    /// Fold one back-channel message into the topic bookkeeping. Keeps the
    /// invariant that a requested (bucket, vbucket) lives in exactly one of
    /// active / rollback / outstanding.
    fn handle_feedback(&mut self, fb: FeedBack) -> Option<Waited> {
        match fb {
            FeedBack::StreamRequest {
                bucket,
                vbno,
                status,
                vbuuid,
                seqno,
                ..
            } => {
                if let Some(out) = self.outstanding.get_mut(&bucket) {
                    out.remove(&vbno);
                }
                let max_vbuckets = self.config.max_vbuckets;
                match status {
                    StreamStatus::Success => {
                        let pool = self.pool_of(&bucket);
                        self.act_ts
                            .entry(bucket.clone())
                            .or_insert_with(|| TsVbuuid::new(&pool, &bucket, max_vbuckets))
                            .set(
                                vbno,
                                TsEntry {
                                    vbuuid,
                                    seqno,
                                    snap_start: 0,
                                    snap_end: 0,
                                },
                            );
                        if let Some(roll) = self.roll_ts.get_mut(&bucket) {
                            roll.remove(vbno);
                        }
                    }
                    StreamStatus::Rollback => {
                        let pool = self.pool_of(&bucket);
                        self.roll_ts
                            .entry(bucket.clone())
                            .or_insert_with(|| TsVbuuid::new(&pool, &bucket, max_vbuckets))
                            .set(
                                vbno,
                                TsEntry {
                                    vbuuid,
                                    seqno,
                                    snap_start: 0,
                                    snap_end: 0,
                                },
                            );
                        if let Some(act) = self.act_ts.get_mut(&bucket) {
                            act.remove(vbno);
                        }
                    }
                    StreamStatus::Error => {
                        if let Some(act) = self.act_ts.get_mut(&bucket) {
                            act.remove(vbno);
                        }
                    }
                }
                Some(Waited::Started(bucket, vbno))
            }
            FeedBack::StreamEnd {
                bucket,
                vbno,
                status,
                ..
            } => {
                if status == StreamStatus::Success {
                    if let Some(act) = self.act_ts.get_mut(&bucket) {
                        act.remove(vbno);
                    }
                    if let Some(req) = self.req_ts.get_mut(&bucket) {
                        req.remove(vbno);
                    }
                    if let Some(assign) = self.assignments.get_mut(&bucket) {
                        assign.remove(&vbno);
                    }
                }
                Some(Waited::Ended(bucket, vbno))
            }
            FeedBack::FinKvData { bucket, kvaddr } => {
                self.kvdata.remove(&(bucket.clone(), kvaddr.clone()));
                // The data path is gone; its vbuckets are no longer active.
                // Their absence from the active timestamps signals the
                // cleanup to the caller.
                let gone: Vec<Vbno> = self
                    .assignments
                    .get(&bucket)
                    .map(|assign| {
                        assign
                            .iter()
                            .filter(|(_, addr)| **addr == kvaddr)
                            .map(|(vbno, _)| *vbno)
                            .collect()
                    })
                    .unwrap_or_default();
                for vbno in gone {
                    if let Some(act) = self.act_ts.get_mut(&bucket) {
                        act.remove(vbno);
                    }
                    if let Some(roll) = self.roll_ts.get_mut(&bucket) {
                        roll.remove(vbno);
                    }
                    if let Some(out) = self.outstanding.get_mut(&bucket) {
                        out.remove(&vbno);
                    }
                    if let Some(assign) = self.assignments.get_mut(&bucket) {
                        assign.remove(&vbno);
                    }
                }
                tracing::warn!(
                    topic = %self.topic,
                    bucket,
                    kvaddr,
                    "kv data path terminated"
                );
                None
            }
        }
    }

    fn pool_of(&self, bucket: &str) -> String {
        self.req_ts
            .get(bucket)
            .map(|ts| ts.pool.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    fn topic_response(&self, err: Option<Error>) -> TopicResponse {
        TopicResponse {
            topic: self.topic.clone(),
            active_timestamps: self
                .act_ts
                .values()
                .filter(|ts| !ts.is_empty())
                .cloned()
                .collect(),
            rollback_timestamps: self
                .roll_ts
                .values()
                .filter(|ts| !ts.is_empty())
                .cloned()
                .collect(),
            err,
        }
    }

    async fn close_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.kvdata) {
            let _ = entry.feeder.close();
            let _ = entry.kvdata.close().await;
        }
    }
}
