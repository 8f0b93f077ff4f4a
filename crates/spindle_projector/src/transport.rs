//! Pluggable admin transport.
//!
//! The admin client speaks this request/response surface; semantic errors
//! travel inside the response envelope, transport failures are returned
//! inline. `LocalTransport` dispatches to an in-process projector.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use spindle_common::ts::{FailoverLog, TsVbuuid};
use spindle_common::{Error, Vbno};

use crate::engine::Instance;
use crate::feed::TopicResponse;
use crate::projector::Projector;

/// Admin operation surface of a projector.
#[derive(Clone, Debug)]
pub enum AdminRequest {
    GetVbmap {
        pool: String,
        bucket: String,
        kvaddrs: Vec<String>,
    },
    GetFailoverLogs {
        pool: String,
        bucket: String,
        vbnos: Vec<Vbno>,
    },
    MutationTopic {
        topic: String,
        endpoint_type: String,
        req_timestamps: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    },
    RestartVbuckets {
        topic: String,
        restart_timestamps: Vec<TsVbuuid>,
    },
    ShutdownVbuckets {
        topic: String,
        shutdown_timestamps: Vec<TsVbuuid>,
    },
    AddBuckets {
        topic: String,
        req_timestamps: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    },
    DelBuckets {
        topic: String,
        buckets: Vec<String>,
    },
    AddInstances {
        topic: String,
        instances: Vec<Instance>,
    },
    DelInstances {
        topic: String,
        uuids: Vec<u64>,
    },
    RepairEndpoints {
        topic: String,
        endpoints: Vec<String>,
    },
    ShutdownTopic {
        topic: String,
    },
}

/// Vbucket map response: kv-node address -> vbuckets it serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VbmapResponse {
    pub kvmap: BTreeMap<String, Vec<Vbno>>,
}

#[derive(Clone, Debug)]
pub enum AdminResponse {
    Vbmap(VbmapResponse),
    FailoverLogs(BTreeMap<Vbno, FailoverLog>),
    Topic(TopicResponse),
    /// Error-kind response; `None` means success.
    Error(Option<Error>),
}

#[async_trait]
pub trait AdminTransport: Send + Sync {
    async fn request(&self, req: AdminRequest) -> Result<AdminResponse, Error>;
}

/// In-process transport bound to a projector.
pub struct LocalTransport {
    projector: Arc<Projector>,
}

impl LocalTransport {
    pub fn new(projector: Arc<Projector>) -> Arc<Self> {
        Arc::new(Self { projector })
    }
}

#[async_trait]
impl AdminTransport for LocalTransport {
    async fn request(&self, req: AdminRequest) -> Result<AdminResponse, Error> {
        let resp = match req {
            AdminRequest::GetVbmap {
                pool,
                bucket,
                kvaddrs,
            } => match self.projector.vbmap(&pool, &bucket, &kvaddrs) {
                Ok(kvmap) => AdminResponse::Vbmap(VbmapResponse { kvmap }),
                Err(err) => AdminResponse::Error(Some(err)),
            },
            AdminRequest::GetFailoverLogs {
                pool,
                bucket,
                vbnos,
            } => match self.projector.failover_logs(&pool, &bucket, &vbnos) {
                Ok(flogs) => AdminResponse::FailoverLogs(flogs),
                Err(err) => AdminResponse::Error(Some(err)),
            },
            AdminRequest::MutationTopic {
                topic,
                endpoint_type,
                req_timestamps,
                instances,
            } => topic_response(
                self.projector
                    .mutation_topic(&topic, &endpoint_type, req_timestamps, instances)
                    .await,
            ),
            AdminRequest::RestartVbuckets {
                topic,
                restart_timestamps,
            } => topic_response(
                self.projector
                    .restart_vbuckets(&topic, restart_timestamps)
                    .await,
            ),
            AdminRequest::ShutdownVbuckets {
                topic,
                shutdown_timestamps,
            } => AdminResponse::Error(
                self.projector
                    .shutdown_vbuckets(&topic, shutdown_timestamps)
                    .await
                    .err(),
            ),
            AdminRequest::AddBuckets {
                topic,
                req_timestamps,
                instances,
            } => topic_response(
                self.projector
                    .add_buckets(&topic, req_timestamps, instances)
                    .await,
            ),
            AdminRequest::DelBuckets { topic, buckets } => {
                AdminResponse::Error(self.projector.del_buckets(&topic, buckets).await.err())
            }
            AdminRequest::AddInstances { topic, instances } => {
                AdminResponse::Error(self.projector.add_instances(&topic, instances).await.err())
            }
            AdminRequest::DelInstances { topic, uuids } => {
                AdminResponse::Error(self.projector.del_instances(&topic, uuids).await.err())
            }
            AdminRequest::RepairEndpoints { topic, endpoints } => AdminResponse::Error(
                self.projector
                    .repair_endpoints(&topic, endpoints)
                    .await
                    .err(),
            ),
            AdminRequest::ShutdownTopic { topic } => {
                AdminResponse::Error(self.projector.shutdown_topic(&topic).await.err())
            }
        };
        Ok(resp)
    }
}

fn topic_response(result: Result<TopicResponse, Error>) -> AdminResponse {
    match result {
        Ok(resp) => AdminResponse::Topic(resp),
        Err(err) => AdminResponse::Error(Some(err)),
    }
}
