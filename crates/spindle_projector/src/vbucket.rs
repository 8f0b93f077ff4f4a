//! Per-vbucket routine: an owning task consuming one vbucket's event stream.
//!
//! One routine exists per (topic, bucket, kv-node, vbucket). Stream events
//! and control commands arrive on a single channel and are drained serially,
//! so endpoints observe events in upstream order. The routine never blocks
//! on an endpoint; overflowing sends are dropped by the endpoint itself.

use std::collections::BTreeMap;

use serde_json::json;
use spindle_common::stats::statistics;
use spindle_common::{Error, Seqno, Statistics, Vbno, Vbuuid};
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::{DataportPayload, RouterEndpoint};
use crate::engine::Engine;
use crate::events::{UprEvent, UprOpcode};

/// Capacity of the routine's combined event/command channel.
const VR_QUEUE_CAPACITY: usize = 128;

enum VrCommand {
    Event(UprEvent),
    AddEngines {
        engines: BTreeMap<u64, Engine>,
        endpoints: BTreeMap<String, RouterEndpoint>,
        reply: oneshot::Sender<()>,
    },
    DeleteEngines {
        uuids: Vec<u64>,
        reply: oneshot::Sender<()>,
    },
    GetStatistics {
        reply: oneshot::Sender<Statistics>,
    },
}

/// Handle to a running vbucket routine.
#[derive(Clone)]
pub struct VbucketRoutine {
    vbno: Vbno,
    tx: mpsc::Sender<VrCommand>,
}

impl VbucketRoutine {
    /// Spawn the routine with its engines and endpoints seeded from the
    /// owning kv data path.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: &str,
        bucket: &str,
        kvaddr: &str,
        vbno: Vbno,
        vbuuid: Vbuuid,
        start_seqno: Seqno,
        engines: BTreeMap<u64, Engine>,
        endpoints: BTreeMap<String, RouterEndpoint>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(VR_QUEUE_CAPACITY);
        let routine = Routine {
            topic: topic.to_string(),
            bucket: bucket.to_string(),
            kvaddr: kvaddr.to_string(),
            vbno,
            vbuuid,
            seqno: start_seqno,
            snap_start: 0,
            snap_end: 0,
            engines,
            endpoints,
            events: 0,
            mutations: 0,
            eval_errors: 0,
        };
        tokio::spawn(routine.run(rx));
        Self { vbno, tx }
    }

    pub fn vbno(&self) -> Vbno {
        self.vbno
    }

    /// Forward one upstream event to the routine.
    pub async fn event(&self, event: UprEvent) -> Result<(), Error> {
        self.tx
            .send(VrCommand::Event(event))
            .await
            .map_err(|_| Error::Cancelled)
    }

    pub async fn add_engines(
        &self,
        engines: BTreeMap<u64, Engine>,
        endpoints: BTreeMap<String, RouterEndpoint>,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VrCommand::AddEngines {
                engines,
                endpoints,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    pub async fn delete_engines(&self, uuids: Vec<u64>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VrCommand::DeleteEngines { uuids, reply })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    pub async fn get_statistics(&self) -> Result<Statistics, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VrCommand::GetStatistics { reply })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }
}

struct Routine {
    topic: String,
    bucket: String,
    kvaddr: String,
    vbno: Vbno,
    vbuuid: Vbuuid,
    seqno: Seqno,
    snap_start: Seqno,
    snap_end: Seqno,
    engines: BTreeMap<u64, Engine>,
    endpoints: BTreeMap<String, RouterEndpoint>,
    events: u64,
    mutations: u64,
    eval_errors: u64,
}

impl Routine {
    async fn run(mut self, mut rx: mpsc::Receiver<VrCommand>) {
        tracing::debug!(
            topic = %self.topic,
            bucket = %self.bucket,
            kvaddr = %self.kvaddr,
            vbno = self.vbno,
            "vbucket routine started"
        );
        while let Some(cmd) = rx.recv().await {
            match cmd {
                VrCommand::Event(event) => {
                    self.events += 1;
                    if self.handle_event(event) {
                        break;
                    }
                }
                VrCommand::AddEngines {
                    engines,
                    endpoints,
                    reply,
                } => {
                    self.engines.extend(engines);
                    self.endpoints.extend(endpoints);
                    let _ = reply.send(());
                }
                VrCommand::DeleteEngines { uuids, reply } => {
                    for uuid in uuids {
                        self.engines.remove(&uuid);
                    }
                    let _ = reply.send(());
                }
                VrCommand::GetStatistics { reply } => {
                    let _ = reply.send(self.stats());
                }
            }
        }
        tracing::debug!(
            topic = %self.topic,
            bucket = %self.bucket,
            vbno = self.vbno,
            "vbucket routine stopped"
        );
    }

    /// Apply one stream event. Returns true when the routine is done.
    fn handle_event(&mut self, event: UprEvent) -> bool {
        match event.opcode {
            UprOpcode::StreamRequest => {
                self.vbuuid = event.vbuuid;
                self.seqno = event.seqno;
                self.broadcast(DataportPayload::StreamBegin {
                    bucket: self.bucket.clone(),
                    vbno: self.vbno,
                    vbuuid: self.vbuuid,
                });
                false
            }
            UprOpcode::Snapshot => {
                self.snap_start = event.snap_start;
                self.snap_end = event.snap_end;
                self.broadcast(DataportPayload::Snapshot {
                    bucket: self.bucket.clone(),
                    vbno: self.vbno,
                    snap_start: event.snap_start,
                    snap_end: event.snap_end,
                });
                false
            }
            UprOpcode::Mutation => {
                self.seqno = event.seqno;
                self.mutations += 1;
                self.route_mutation(&event);
                false
            }
            UprOpcode::Deletion | UprOpcode::Expiration => {
                self.seqno = event.seqno;
                self.mutations += 1;
                self.route_deletion(&event);
                false
            }
            UprOpcode::StreamEnd => {
                self.broadcast(DataportPayload::StreamEnd {
                    bucket: self.bucket.clone(),
                    vbno: self.vbno,
                });
                true
            }
        }
    }

    fn route_mutation(&mut self, event: &UprEvent) {
        for engine in self.engines.values() {
            match engine.transform(&event.key, &event.value) {
                Ok(Some((index_key, raddrs))) => {
                    for raddr in raddrs {
                        if let Some(endpoint) = self.endpoints.get(&raddr) {
                            endpoint.send(DataportPayload::Mutation {
                                bucket: self.bucket.clone(),
                                vbno: self.vbno,
                                seqno: event.seqno,
                                instance_uuid: engine.uuid(),
                                index_key: index_key.clone(),
                                doc_key: event.key.clone(),
                            });
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.eval_errors += 1;
                    tracing::warn!(
                        topic = %self.topic,
                        bucket = %self.bucket,
                        vbno = self.vbno,
                        instance = engine.uuid(),
                        error = %err,
                        "evaluator failed, mutation skipped"
                    );
                }
            }
        }
    }

    fn route_deletion(&mut self, event: &UprEvent) {
        for engine in self.engines.values() {
            for raddr in engine.route_deletion(&event.key) {
                if let Some(endpoint) = self.endpoints.get(&raddr) {
                    endpoint.send(DataportPayload::Deletion {
                        bucket: self.bucket.clone(),
                        vbno: self.vbno,
                        seqno: event.seqno,
                        instance_uuid: engine.uuid(),
                        doc_key: event.key.clone(),
                    });
                }
            }
        }
    }

    fn broadcast(&self, payload: DataportPayload) {
        for endpoint in self.endpoints.values() {
            endpoint.send(payload.clone());
        }
    }

    fn stats(&self) -> Statistics {
        statistics([
            ("vbno", json!(self.vbno)),
            ("vbuuid", json!(self.vbuuid)),
            ("seqno", json!(self.seqno)),
            ("snap_start", json!(self.snap_start)),
            ("snap_end", json!(self.snap_end)),
            ("events", json!(self.events)),
            ("mutations", json!(self.mutations)),
            ("eval_errors", json!(self.eval_errors)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use spindle_common::ts::FailoverLog;

    use super::*;
    use crate::engine::Instance;

    fn engine_for(raddr: &str) -> (u64, Engine) {
        let inst = Instance {
            uuid: 11,
            bucket: "default".into(),
            fields: vec!["city".into()],
            is_primary: false,
            endpoints: vec![raddr.to_string()],
        };
        (11, inst.to_engine())
    }

    fn spawn_routine(raddr: &str) -> (VbucketRoutine, mpsc::Receiver<DataportPayload>) {
        let (endpoint, rx) = RouterEndpoint::pair(raddr);
        let (uuid, engine) = engine_for(raddr);
        let vr = VbucketRoutine::new(
            "topic-t",
            "default",
            "kv-1:11210",
            3,
            900,
            0,
            BTreeMap::from([(uuid, engine)]),
            BTreeMap::from([(raddr.to_string(), endpoint)]),
        );
        (vr, rx)
    }

    #[tokio::test]
    async fn stream_lifecycle_reaches_endpoint_in_order() {
        let (vr, mut rx) = spawn_routine("indexer-1:9100");

        let mut req = UprEvent::stream_request(3, FailoverLog(vec![(900, 0)]));
        req.vbuuid = 900;
        vr.event(req).await.unwrap();
        vr.event(UprEvent::snapshot(3, 0, 2)).await.unwrap();
        vr.event(UprEvent::mutation(
            3,
            1,
            Bytes::from_static(b"u1"),
            Bytes::from_static(br#"{"city":"oslo"}"#),
        ))
        .await
        .unwrap();
        vr.event(UprEvent::deletion(3, 2, Bytes::from_static(b"u1")))
            .await
            .unwrap();
        vr.event(UprEvent::stream_end(3)).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            DataportPayload::StreamBegin { vbno: 3, vbuuid: 900, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            DataportPayload::Snapshot { snap_start: 0, snap_end: 2, .. }
        ));
        match rx.recv().await.unwrap() {
            DataportPayload::Mutation {
                seqno, index_key, ..
            } => {
                assert_eq!(seqno, 1);
                assert_eq!(index_key, br#"["oslo"]"#.to_vec());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            DataportPayload::Deletion { seqno: 2, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            DataportPayload::StreamEnd { vbno: 3, .. }
        ));

        // StreamEnd terminates the routine.
        assert!(vr.event(UprEvent::snapshot(3, 0, 4)).await.is_err());
    }

    #[tokio::test]
    async fn delete_engines_stops_routing() {
        let (vr, mut rx) = spawn_routine("indexer-1:9100");
        vr.event(UprEvent::stream_request(3, FailoverLog(vec![(900, 0)])))
            .await
            .unwrap();
        let _ = rx.recv().await; // StreamBegin

        vr.delete_engines(vec![11]).await.unwrap();
        vr.event(UprEvent::mutation(
            3,
            5,
            Bytes::from_static(b"u2"),
            Bytes::from_static(br#"{"city":"bergen"}"#),
        ))
        .await
        .unwrap();

        let stats = vr.get_statistics().await.unwrap();
        assert_eq!(stats["mutations"], json!(1));
        assert!(rx.try_recv().is_err());
    }
}
