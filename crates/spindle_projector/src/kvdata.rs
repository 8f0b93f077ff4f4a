//! KV data path: owns all vbucket routines for one (bucket, kv-node).
//!
//! Data-path concurrency model:
//!
//! ```text
//!               back-channel
//!     feed <---------------------*   KvData::new()
//!                StreamRequest   |     |            *---> vbucket
//!                    StreamEnd   |   (spawn)        |
//!                                |     |            *---> vbucket
//!        add_engines() --*-----> run_scatter -------*---> vbucket
//!     delete_engines() --*
//!          update_ts() --*
//!     get_statistics() --*
//!              close() --*
//! ```
//!
//! Control commands queue on a bounded server channel and are handled
//! serially between stream events. Callers observe task shutdown as
//! `Error::Cancelled` when their reply channel is dropped.

use std::collections::BTreeMap;

use futures_util::FutureExt;
use serde_json::json;
use spindle_common::stats::statistics;
use spindle_common::ts::TsVbuuid;
use spindle_common::{Error, Seqno, Statistics, Vbno, Vbuuid};
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::RouterEndpoint;
use crate::engine::Engine;
use crate::events::{StreamStatus, UprEvent, UprOpcode};
use crate::vbucket::VbucketRoutine;

/// Maximum outstanding control operations per data path.
const KV_COMMAND_CAPACITY: usize = 16;

/// Messages the data path posts to its parent feed.
#[derive(Clone, Debug)]
pub enum FeedBack {
    StreamRequest {
        bucket: String,
        kvaddr: String,
        vbno: Vbno,
        status: StreamStatus,
        vbuuid: Vbuuid,
        /// Start seqno on success; rollback seqno on rollback.
        seqno: Seqno,
    },
    StreamEnd {
        bucket: String,
        kvaddr: String,
        vbno: Vbno,
        status: StreamStatus,
    },
    /// The data path has terminated and published stream-ends downstream.
    FinKvData { bucket: String, kvaddr: String },
}

enum KvCommand {
    AddEngines {
        engines: BTreeMap<u64, Engine>,
        endpoints: BTreeMap<String, RouterEndpoint>,
        reply: oneshot::Sender<()>,
    },
    DeleteEngines {
        uuids: Vec<u64>,
        reply: oneshot::Sender<()>,
    },
    UpdateTs {
        ts: TsVbuuid,
        reply: oneshot::Sender<()>,
    },
    GetStatistics {
        reply: oneshot::Sender<Statistics>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the data path for one (bucket, kv-node).
#[derive(Clone)]
pub struct KvData {
    bucket: String,
    kvaddr: String,
    sbch: mpsc::Sender<KvCommand>,
}

impl KvData {
    /// Spawn the scatter task over `mutch`, the upstream event stream.
    pub fn new(
        topic: &str,
        bucket: &str,
        kvaddr: &str,
        req_ts: TsVbuuid,
        engines: BTreeMap<u64, Engine>,
        endpoints: BTreeMap<String, RouterEndpoint>,
        mutch: mpsc::Receiver<UprEvent>,
        backch: mpsc::UnboundedSender<FeedBack>,
    ) -> Self {
        let (sbch, sbch_rx) = mpsc::channel(KV_COMMAND_CAPACITY);
        let scatter = Scatter {
            topic: topic.to_string(),
            bucket: bucket.to_string(),
            kvaddr: kvaddr.to_string(),
            ts: req_ts,
            vrs: BTreeMap::new(),
            engines,
            endpoints,
            backch,
            events: 0,
        };
        tokio::spawn(run_scatter(scatter, mutch, sbch_rx));
        tracing::info!(topic, bucket, kvaddr, "kv data path started");
        Self {
            bucket: bucket.to_string(),
            kvaddr: kvaddr.to_string(),
            sbch,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn kvaddr(&self) -> &str {
        &self.kvaddr
    }

    /// Add engines and endpoints, synchronous call.
    pub async fn add_engines(
        &self,
        engines: BTreeMap<u64, Engine>,
        endpoints: BTreeMap<String, RouterEndpoint>,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.failsafe(
            KvCommand::AddEngines {
                engines,
                endpoints,
                reply,
            },
            rx,
        )
        .await
    }

    /// Delete engines by instance uuid, synchronous call.
    pub async fn delete_engines(&self, uuids: Vec<u64>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.failsafe(KvCommand::DeleteEngines { uuids, reply }, rx)
            .await
    }

    /// Union a new set of requested positions into the running timestamp.
    pub async fn update_ts(&self, ts: TsVbuuid) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.failsafe(KvCommand::UpdateTs { ts, reply }, rx).await
    }

    pub async fn get_statistics(&self) -> Result<Statistics, Error> {
        let (reply, rx) = oneshot::channel();
        self.failsafe(KvCommand::GetStatistics { reply }, rx).await
    }

    /// Stop the scatter task, synchronous call.
    pub async fn close(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.failsafe(KvCommand::Close { reply }, rx).await
    }

    /// Queue a command and await the reply; a dropped reply channel means
    /// the task shut down underneath us.
    async fn failsafe<T>(&self, cmd: KvCommand, rx: oneshot::Receiver<T>) -> Result<T, Error> {
        self.sbch.send(cmd).await.map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }
}

struct Scatter {
    topic: String,
    bucket: String,
    kvaddr: String,
    ts: TsVbuuid,
    vrs: BTreeMap<Vbno, VbucketRoutine>,
    engines: BTreeMap<u64, Engine>,
    endpoints: BTreeMap<String, RouterEndpoint>,
    backch: mpsc::UnboundedSender<FeedBack>,
    events: u64,
}

async fn run_scatter(
    mut scatter: Scatter,
    mut mutch: mpsc::Receiver<UprEvent>,
    mut sbch: mpsc::Receiver<KvCommand>,
) {
    let outcome = std::panic::AssertUnwindSafe(scatter.scatter_loop(&mut mutch, &mut sbch))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        tracing::error!(
            topic = %scatter.topic,
            bucket = %scatter.bucket,
            kvaddr = %scatter.kvaddr,
            "scatter loop crashed"
        );
    }
    scatter.publish_stream_end().await;
    let _ = scatter.backch.send(FeedBack::FinKvData {
        bucket: scatter.bucket.clone(),
        kvaddr: scatter.kvaddr.clone(),
    });
    tracing::info!(
        topic = %scatter.topic,
        bucket = %scatter.bucket,
        kvaddr = %scatter.kvaddr,
        "kv data path stopped"
    );
}

impl Scatter {
    async fn scatter_loop(
        &mut self,
        mutch: &mut mpsc::Receiver<UprEvent>,
        sbch: &mut mpsc::Receiver<KvCommand>,
    ) {
        loop {
            tokio::select! {
                event = mutch.recv() => match event {
                    Some(event) => {
                        self.events += 1;
                        self.scatter_mutation(event).await;
                        // All vbuckets have ended for this stream.
                        if self.vrs.is_empty() {
                            break;
                        }
                    }
                    // Upstream has closed; survivors get a synthetic
                    // StreamEnd on the shutdown path.
                    None => break,
                },
                cmd = sbch.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Returns true on Close.
    async fn handle_command(&mut self, cmd: KvCommand) -> bool {
        match cmd {
            KvCommand::AddEngines {
                engines,
                endpoints,
                reply,
            } => {
                self.engines.extend(engines);
                self.endpoints.extend(endpoints);
                for vr in self.vrs.values() {
                    let _ = vr
                        .add_engines(self.engines.clone(), self.endpoints.clone())
                        .await;
                }
                let _ = reply.send(());
                false
            }
            KvCommand::DeleteEngines { uuids, reply } => {
                for vr in self.vrs.values() {
                    let _ = vr.delete_engines(uuids.clone()).await;
                }
                for uuid in &uuids {
                    self.engines.remove(uuid);
                }
                let _ = reply.send(());
                false
            }
            KvCommand::UpdateTs { ts, reply } => {
                self.ts = self.ts.union(&ts);
                let _ = reply.send(());
                false
            }
            KvCommand::GetStatistics { reply } => {
                let mut vbuckets = serde_json::Map::new();
                for (vbno, vr) in &self.vrs {
                    if let Ok(stats) = vr.get_statistics().await {
                        vbuckets.insert(vbno.to_string(), json!(stats));
                    }
                }
                let _ = reply.send(statistics([
                    ("events", json!(self.events)),
                    ("vbuckets", json!(vbuckets)),
                ]));
                false
            }
            KvCommand::Close { reply } => {
                let _ = reply.send(());
                true
            }
        }
    }

    async fn scatter_mutation(&mut self, event: UprEvent) {
        let vbno = event.vbno;
        match event.opcode {
            UprOpcode::StreamRequest => {
                let posted = match event.status {
                    StreamStatus::Rollback => {
                        tracing::info!(
                            topic = %self.topic,
                            bucket = %self.bucket,
                            vbno,
                            rollback_seqno = event.seqno,
                            "stream request rollback"
                        );
                        (StreamStatus::Rollback, event.vbuuid, event.seqno)
                    }
                    StreamStatus::Error => {
                        tracing::error!(
                            topic = %self.topic,
                            bucket = %self.bucket,
                            vbno,
                            "stream request failed"
                        );
                        (StreamStatus::Error, 0, 0)
                    }
                    StreamStatus::Success => self.start_routine(event).await,
                };
                let _ = self.backch.send(FeedBack::StreamRequest {
                    bucket: self.bucket.clone(),
                    kvaddr: self.kvaddr.clone(),
                    vbno,
                    status: posted.0,
                    vbuuid: posted.1,
                    seqno: posted.2,
                });
            }
            UprOpcode::StreamEnd => {
                if event.status != StreamStatus::Success {
                    tracing::error!(
                        topic = %self.topic,
                        bucket = %self.bucket,
                        vbno,
                        status = ?event.status,
                        "stream end failure"
                    );
                } else if let Some(vr) = self.vrs.remove(&vbno) {
                    let _ = vr.event(event.clone()).await;
                } else {
                    tracing::error!(
                        topic = %self.topic,
                        bucket = %self.bucket,
                        vbno,
                        "duplicate stream end"
                    );
                }
                let _ = self.backch.send(FeedBack::StreamEnd {
                    bucket: self.bucket.clone(),
                    kvaddr: self.kvaddr.clone(),
                    vbno,
                    status: event.status,
                });
            }
            UprOpcode::Mutation
            | UprOpcode::Deletion
            | UprOpcode::Expiration
            | UprOpcode::Snapshot => {
                if let Some(vr) = self.vrs.get(&vbno) {
                    let _ = vr.event(event).await;
                } else {
                    tracing::error!(
                        topic = %self.topic,
                        bucket = %self.bucket,
                        vbno,
                        "event for unknown vbucket"
                    );
                }
            }
        }
    }

    /// Latch the vbuuid from the newest failover-log entry, seed the routine
    /// with the current engines and endpoints, and forward the event.
    async fn start_routine(&mut self, mut event: UprEvent) -> (StreamStatus, Vbuuid, Seqno) {
        let vbno = event.vbno;
        let latest = event
            .failover_log
            .as_ref()
            .ok_or(Error::EmptyFailoverLog)
            .and_then(|flog| flog.latest());
        let (vbuuid, _) = match latest {
            Ok(pair) => pair,
            Err(_) => {
                tracing::error!(
                    topic = %self.topic,
                    bucket = %self.bucket,
                    vbno,
                    "stream request without failover log"
                );
                return (StreamStatus::Error, 0, 0);
            }
        };
        let seqno = self.ts.seqno_for(vbno);
        if self.vrs.contains_key(&vbno) {
            tracing::error!(
                topic = %self.topic,
                bucket = %self.bucket,
                vbno,
                "duplicate stream request"
            );
            return (StreamStatus::Success, vbuuid, seqno);
        }
        event.vbuuid = vbuuid;
        event.seqno = seqno;
        let vr = VbucketRoutine::new(
            &self.topic,
            &self.bucket,
            &self.kvaddr,
            vbno,
            vbuuid,
            seqno,
            self.engines.clone(),
            self.endpoints.clone(),
        );
        let _ = vr.event(event).await;
        self.vrs.insert(vbno, vr);
        (StreamStatus::Success, vbuuid, seqno)
    }

    /// Broadcast a synthetic StreamEnd to every surviving routine.
    async fn publish_stream_end(&mut self) {
        for (vbno, vr) in std::mem::take(&mut self.vrs) {
            let _ = vr.event(UprEvent::stream_end(vbno)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use spindle_common::ts::{FailoverLog, TsEntry};

    use super::*;
    use crate::endpoint::DataportPayload;
    use crate::engine::Instance;

    const RADDR: &str = "indexer-1:9100";

    struct Rig {
        kvdata: KvData,
        mutch: mpsc::Sender<UprEvent>,
        backch: mpsc::UnboundedReceiver<FeedBack>,
        endpoint_rx: mpsc::Receiver<DataportPayload>,
    }

    fn rig() -> Rig {
        let mut ts = TsVbuuid::new("default", "default", 64);
        ts.set(
            9,
            TsEntry {
                vbuuid: 0,
                seqno: 12,
                snap_start: 0,
                snap_end: 0,
            },
        );
        let inst = Instance {
            uuid: 5,
            bucket: "default".into(),
            fields: vec!["city".into()],
            is_primary: false,
            endpoints: vec![RADDR.into()],
        };
        let (endpoint, endpoint_rx) = RouterEndpoint::pair(RADDR);
        let (mutch, mutch_rx) = mpsc::channel(64);
        let (backch_tx, backch) = mpsc::unbounded_channel();
        let kvdata = KvData::new(
            "topic-t",
            "default",
            "kv-1:11210",
            ts,
            BTreeMap::from([(5, inst.to_engine())]),
            BTreeMap::from([(RADDR.to_string(), endpoint)]),
            mutch_rx,
            backch_tx,
        );
        Rig {
            kvdata,
            mutch,
            backch,
            endpoint_rx,
        }
    }

    #[tokio::test]
    async fn stream_request_seeds_routine_from_timestamp() {
        let mut rig = rig();
        rig.mutch
            .send(UprEvent::stream_request(9, FailoverLog(vec![(777, 40)])))
            .await
            .unwrap();

        match rig.backch.recv().await.unwrap() {
            FeedBack::StreamRequest {
                vbno,
                status,
                vbuuid,
                seqno,
                ..
            } => {
                assert_eq!(vbno, 9);
                assert_eq!(status, StreamStatus::Success);
                assert_eq!(vbuuid, 777);
                assert_eq!(seqno, 12);
            }
            other => panic!("unexpected feedback: {other:?}"),
        }
        assert!(matches!(
            rig.endpoint_rx.recv().await.unwrap(),
            DataportPayload::StreamBegin { vbno: 9, vbuuid: 777, .. }
        ));

        rig.mutch
            .send(UprEvent::mutation(
                9,
                13,
                Bytes::from_static(b"u9"),
                Bytes::from_static(br#"{"city":"turin"}"#),
            ))
            .await
            .unwrap();
        assert!(matches!(
            rig.endpoint_rx.recv().await.unwrap(),
            DataportPayload::Mutation { vbno: 9, seqno: 13, .. }
        ));
    }

    #[tokio::test]
    async fn rollback_creates_no_routine() {
        let mut rig = rig();
        rig.mutch
            .send(UprEvent::stream_request_rollback(9, 42))
            .await
            .unwrap();
        match rig.backch.recv().await.unwrap() {
            FeedBack::StreamRequest { status, seqno, .. } => {
                assert_eq!(status, StreamStatus::Rollback);
                assert_eq!(seqno, 42);
            }
            other => panic!("unexpected feedback: {other:?}"),
        }

        // No routine was created, so the data path exits on its own.
        assert!(matches!(
            rig.backch.recv().await.unwrap(),
            FeedBack::FinKvData { .. }
        ));
        assert!(matches!(
            rig.kvdata.get_statistics().await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn last_stream_end_exits_the_data_path() {
        let mut rig = rig();
        rig.mutch
            .send(UprEvent::stream_request(9, FailoverLog(vec![(777, 0)])))
            .await
            .unwrap();
        let _ = rig.backch.recv().await;
        let _ = rig.endpoint_rx.recv().await; // StreamBegin

        rig.mutch.send(UprEvent::stream_end(9)).await.unwrap();
        assert!(matches!(
            rig.backch.recv().await.unwrap(),
            FeedBack::StreamEnd { vbno: 9, .. }
        ));
        assert!(matches!(
            rig.endpoint_rx.recv().await.unwrap(),
            DataportPayload::StreamEnd { vbno: 9, .. }
        ));

        // The routine map is empty: the task exits and publishes its fin
        // even though upstream is still open.
        assert!(matches!(
            rig.backch.recv().await.unwrap(),
            FeedBack::FinKvData { .. }
        ));
    }

    #[tokio::test]
    async fn close_publishes_stream_end_and_fin() {
        let mut rig = rig();
        rig.mutch
            .send(UprEvent::stream_request(9, FailoverLog(vec![(777, 0)])))
            .await
            .unwrap();
        let _ = rig.backch.recv().await;
        let _ = rig.endpoint_rx.recv().await; // StreamBegin

        rig.kvdata.close().await.unwrap();
        assert!(matches!(
            rig.backch.recv().await.unwrap(),
            FeedBack::FinKvData { .. }
        ));
        assert!(matches!(
            rig.endpoint_rx.recv().await.unwrap(),
            DataportPayload::StreamEnd { vbno: 9, .. }
        ));

        // Control calls after shutdown observe cancellation.
        assert!(matches!(
            rig.kvdata.update_ts(TsVbuuid::new("default", "default", 64)).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn upstream_close_terminates_the_data_path() {
        let mut rig = rig();
        rig.mutch
            .send(UprEvent::stream_request(9, FailoverLog(vec![(777, 0)])))
            .await
            .unwrap();
        let _ = rig.backch.recv().await;
        let _ = rig.endpoint_rx.recv().await;

        drop(rig.mutch);
        // Surviving routines get a synthetic StreamEnd before FinKvData.
        assert!(matches!(
            rig.endpoint_rx.recv().await.unwrap(),
            DataportPayload::StreamEnd { vbno: 9, .. }
        ));
        assert!(matches!(
            rig.backch.recv().await.unwrap(),
            FeedBack::FinKvData { .. }
        ));
    }
}
