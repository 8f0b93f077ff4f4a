//! Projector front-end: the topic -> feed map behind the admin surface.
//!
//! The cluster-info cache and the upstream feeder are external collaborators
//! and enter as oracle traits; the projector only consumes node lists,
//! vbucket maps, failover logs and per-node event streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use spindle_common::ts::{FailoverLog, TsVbuuid};
use spindle_common::{Config, Error, Seqno, Statistics, Vbno, Vbuuid};
use tokio::sync::{mpsc, Mutex};

use crate::endpoint::EndpointFactory;
use crate::engine::Instance;
use crate::events::UprEvent;
use crate::feed::{Feed, TopicResponse};

/// Cluster-info oracle: vbucket maps and failover logs per bucket.
pub trait KvCluster: Send + Sync {
    /// Map kv-node address -> vbuckets it serves. An empty `kvaddrs` filter
    /// means all nodes.
    fn vbmap(
        &self,
        pool: &str,
        bucket: &str,
        kvaddrs: &[String],
    ) -> Result<BTreeMap<String, Vec<Vbno>>, Error>;

    fn failover_logs(
        &self,
        pool: &str,
        bucket: &str,
        vbnos: &[Vbno],
    ) -> Result<BTreeMap<Vbno, FailoverLog>, Error>;
}

/// Opens the upstream event stream for one (bucket, kv-node).
pub trait FeederFactory: Send + Sync {
    fn open(
        &self,
        topic: &str,
        bucket: &str,
        kvaddr: &str,
    ) -> Result<(Box<dyn BucketFeeder>, mpsc::Receiver<UprEvent>), Error>;
}

/// Control half of one upstream connection. Responses arrive as events on
/// the receiver returned by [`FeederFactory::open`].
pub trait BucketFeeder: Send + Sync {
    fn start_stream(
        &self,
        vbno: Vbno,
        vbuuid: Vbuuid,
        seqno: Seqno,
        snap_start: Seqno,
        snap_end: Seqno,
    ) -> Result<(), Error>;

    fn end_stream(&self, vbno: Vbno) -> Result<(), Error>;

    fn close(&self) -> Result<(), Error>;
}

/// Hosts all feeds on this node, keyed by topic.
pub struct Projector {
    config: Config,
    cluster: Arc<dyn KvCluster>,
    feeders: Arc<dyn FeederFactory>,
    endpoint_factory: Arc<dyn EndpointFactory>,
    topics: Mutex<BTreeMap<String, Feed>>,
}

impl Projector {
    pub fn new(
        config: Config,
        cluster: Arc<dyn KvCluster>,
        feeders: Arc<dyn FeederFactory>,
        endpoint_factory: Arc<dyn EndpointFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cluster,
            feeders,
            endpoint_factory,
            topics: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vbmap(
        &self,
        pool: &str,
        bucket: &str,
        kvaddrs: &[String],
    ) -> Result<BTreeMap<String, Vec<Vbno>>, Error> {
        self.cluster.vbmap(pool, bucket, kvaddrs)
    }

    pub fn failover_logs(
        &self,
        pool: &str,
        bucket: &str,
        vbnos: &[Vbno],
    ) -> Result<BTreeMap<Vbno, FailoverLog>, Error> {
        self.cluster.failover_logs(pool, bucket, vbnos)
    }

    /// Create the topic if absent, then apply the request to its feed.
    pub async fn mutation_topic(
        &self,
        topic: &str,
        endpoint_type: &str,
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        let feed = {
            let mut topics = self.topics.lock().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| {
                    Feed::new(
                        topic,
                        self.config.clone(),
                        self.cluster.clone(),
                        self.feeders.clone(),
                        self.endpoint_factory.clone(),
                    )
                })
                .clone()
        };
        feed.mutation_topic(endpoint_type, req_ts, instances).await
    }

    pub async fn restart_vbuckets(
        &self,
        topic: &str,
        restart_ts: Vec<TsVbuuid>,
    ) -> Result<TopicResponse, Error> {
        self.feed(topic).await?.restart_vbuckets(restart_ts).await
    }

    pub async fn shutdown_vbuckets(
        &self,
        topic: &str,
        shutdown_ts: Vec<TsVbuuid>,
    ) -> Result<(), Error> {
        self.feed(topic).await?.shutdown_vbuckets(shutdown_ts).await
    }

    pub async fn add_buckets(
        &self,
        topic: &str,
        req_ts: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        self.feed(topic).await?.add_buckets(req_ts, instances).await
    }

    pub async fn del_buckets(&self, topic: &str, buckets: Vec<String>) -> Result<(), Error> {
        self.feed(topic).await?.del_buckets(buckets).await
    }

    pub async fn add_instances(
        &self,
        topic: &str,
        instances: Vec<Instance>,
    ) -> Result<(), Error> {
        self.feed(topic).await?.add_instances(instances).await
    }

    pub async fn del_instances(&self, topic: &str, uuids: Vec<u64>) -> Result<(), Error> {
        self.feed(topic).await?.del_instances(uuids).await
    }

    pub async fn repair_endpoints(
        &self,
        topic: &str,
        endpoints: Vec<String>,
    ) -> Result<(), Error> {
        self.feed(topic).await?.repair_endpoints(endpoints).await
    }

    pub async fn get_statistics(&self, topic: &str) -> Result<Statistics, Error> {
        self.feed(topic).await?.get_statistics().await
    }

    /// Stop the topic's feed and forget it. Idempotent: an unknown topic is
    /// reported as missing.
    pub async fn shutdown_topic(&self, topic: &str) -> Result<(), Error> {
        let feed = {
            let mut topics = self.topics.lock().await;
            topics.remove(topic).ok_or(Error::TopicMissing)?
        };
        feed.shutdown().await
    }

    async fn feed(&self, topic: &str) -> Result<Feed, Error> {
        let topics = self.topics.lock().await;
        topics.get(topic).cloned().ok_or(Error::TopicMissing)
    }
}
