//! End-to-end feed scenarios against the simulated kv cluster.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spindle_common::{Config, Error, Vbno};
use spindle_projector::sim::{CollectorFactory, SimCluster, SimFeederFactory};
use spindle_projector::{
    Client, DataportPayload, Instance, LocalTransport, Projector, UprEvent,
};

const POOL: &str = "default";
const BUCKET: &str = "default";
const ENDPOINT: &str = "indexer-1:9100";

struct Cluster {
    client: Client,
    feeders: Arc<SimFeederFactory>,
    collector: Arc<CollectorFactory>,
}

fn cluster(max_vbuckets: usize) -> Cluster {
    let config = Config {
        max_vbuckets,
        ..Config::default()
    };
    let sim = SimCluster::new(vec!["kv-1:11210".into(), "kv-2:11210".into()], max_vbuckets);
    let feeders = SimFeederFactory::new(sim.clone());
    let collector = CollectorFactory::new();
    let projector = Projector::new(
        config.clone(),
        sim,
        feeders.clone(),
        collector.clone(),
    );
    let client = Client::new(LocalTransport::new(projector), &config);
    Cluster {
        client,
        feeders,
        collector,
    }
}

fn instance(uuid: u64) -> Instance {
    Instance {
        uuid,
        bucket: BUCKET.into(),
        fields: vec!["city".into()],
        is_primary: false,
        endpoints: vec![ENDPOINT.into()],
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn initial_topic_streams_every_vbucket() {
    let cluster = cluster(1024);
    let resp = cluster
        .client
        .initial_topic_request("backfill", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();

    assert_eq!(resp.active_timestamps.len(), 1);
    let active = &resp.active_timestamps[0];
    assert_eq!(active.bucket, BUCKET);
    assert_eq!(active.len(), 1024);
    assert!(resp.rollback_timestamps.is_empty());

    // Events appear at the endpoint in per-vbucket order.
    for seqno in 1..=3u64 {
        let doc = format!(r#"{{"city":"c{seqno}"}}"#);
        assert!(cluster.feeders.emit(
            BUCKET,
            UprEvent::mutation(7, seqno, Bytes::from_static(b"doc-7"), Bytes::from(doc)),
        ));
    }
    wait_until(|| {
        cluster
            .collector
            .payloads(ENDPOINT)
            .iter()
            .filter(|p| matches!(p, DataportPayload::Mutation { vbno: 7, .. }))
            .count()
            == 3
    })
    .await;

    let seqnos: Vec<u64> = cluster
        .collector
        .payloads(ENDPOINT)
        .iter()
        .filter_map(|p| match p {
            DataportPayload::Mutation { vbno: 7, seqno, .. } => Some(*seqno),
            _ => None,
        })
        .collect();
    assert_eq!(seqnos, vec![1, 2, 3]);
}

#[tokio::test]
async fn mutation_topic_is_idempotent() {
    let cluster = cluster(64);
    let first = cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();
    let second = cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();

    assert_eq!(first.active_timestamps.len(), second.active_timestamps.len());
    assert_eq!(
        first.active_timestamps[0].vbnos(),
        second.active_timestamps[0].vbnos()
    );
    assert!(second.rollback_timestamps.is_empty());
}

#[tokio::test]
async fn rollback_is_reported_not_errored() {
    let cluster = cluster(64);
    cluster.feeders.script_rollback(BUCKET, 17, 42);

    let resp = cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();

    assert_eq!(resp.rollback_timestamps.len(), 1);
    let roll = &resp.rollback_timestamps[0];
    assert_eq!(roll.vbnos(), vec![17]);
    assert_eq!(roll.seqno_for(17), 42);
    assert!(!resp.active_timestamps[0].contains(17));
    assert_eq!(resp.active_timestamps[0].len(), 63);

    // After the indexer rewinds, restarting the vbucket activates it.
    cluster.feeders.clear_rollback(BUCKET, 17);
    let mut restart_ts = spindle_common::TsVbuuid::new(POOL, BUCKET, 64);
    restart_ts.set(
        17,
        spindle_common::TsEntry {
            vbuuid: 0,
            seqno: 42,
            snap_start: 0,
            snap_end: 42,
        },
    );
    let resp = cluster
        .client
        .restart_vbuckets("maint", vec![restart_ts])
        .await
        .unwrap();
    assert!(resp.active_timestamps[0].contains(17));
    assert_eq!(resp.active_timestamps[0].len(), 64);
    assert!(resp.rollback_timestamps.is_empty());
}

#[tokio::test]
async fn shutdown_vbuckets_drains_the_requested_set() {
    let cluster = cluster(16);
    let resp = cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();
    let active = resp.active_timestamps[0].clone();
    assert_eq!(active.len(), 16);

    let shutdown: Vec<Vbno> = vec![0, 1, 2];
    let shutdown_ts = active.filter_vbuckets(&shutdown);
    cluster
        .client
        .shutdown_vbuckets("maint", vec![shutdown_ts])
        .await
        .unwrap();

    let resp = cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();
    // Idempotent retry restarts the drained vbuckets.
    assert_eq!(resp.active_timestamps[0].len(), 16);
}

#[tokio::test]
async fn shutdown_topic_forgets_the_feed() {
    let cluster = cluster(16);
    cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1)])
        .await
        .unwrap();

    cluster.client.shutdown_topic("maint").await.unwrap();

    let err = cluster
        .client
        .restart_vbuckets("maint", vec![])
        .await
        .unwrap_err();
    assert_eq!(err, Error::TopicMissing);

    let err = cluster.client.shutdown_topic("maint").await.unwrap_err();
    assert_eq!(err, Error::TopicMissing);
}

#[tokio::test]
async fn del_instances_keeps_at_least_one_engine_per_bucket() {
    let cluster = cluster(16);
    cluster
        .client
        .initial_topic_request("maint", POOL, "dataport", vec![instance(1), instance(2)])
        .await
        .unwrap();

    cluster.client.del_instances("maint", vec![2]).await.unwrap();

    // Deleting the last engine requires DelBuckets.
    let err = cluster
        .client
        .del_instances("maint", vec![1])
        .await
        .unwrap_err();
    assert_eq!(err, Error::InconsistentFeed);

    cluster
        .client
        .del_buckets("maint", vec![BUCKET.into()])
        .await
        .unwrap();
}
