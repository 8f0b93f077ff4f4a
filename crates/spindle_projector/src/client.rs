//! Admin client for a projector's control surface.
//!
//! General notes on the client APIs:
//!   - every topic-mutating API is idempotent: it can be retried until all
//!     requested vbuckets are started and the call returns success;
//!   - a bucket missing from the response active timestamps was shut down
//!     and cleaned up after upstream errors; it must be added anew;
//!   - adding a bucket requires at least one instance for it, and the last
//!     instance of a bucket is deleted via DelBuckets, not DelInstances.
//!
//! Retry policy: only transport errors that look like connection-refused are
//! retried, sleeping `retry_interval_ms` between attempts (multiplied by
//! `exponential_backoff` after each retry when non-zero). `max_retries`
//! bounds the attempts, zero meaning retry forever; a zero interval disables
//! retry entirely. Semantic errors and response timeouts are never retried.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use spindle_common::ts::{FailoverLog, TsVbuuid};
use spindle_common::{Config, Error, Vbno};

use crate::engine::Instance;
use crate::feed::TopicResponse;
use crate::transport::{AdminRequest, AdminResponse, AdminTransport, VbmapResponse};

/// Client for one projector's adminport.
pub struct Client {
    transport: Arc<dyn AdminTransport>,
    max_vbuckets: usize,
    retry_interval_ms: u64,
    max_retries: u32,
    exp_backoff: u64,
    response_timeout: Duration,
}

impl Client {
    pub fn new(transport: Arc<dyn AdminTransport>, config: &Config) -> Self {
        Self {
            transport,
            max_vbuckets: config.max_vbuckets,
            retry_interval_ms: config.client.retry_interval_ms,
            max_retries: config.client.max_retries,
            exp_backoff: config.client.exponential_backoff,
            response_timeout: Duration::from_millis(config.response_timeout_ms),
        }
    }

    pub async fn get_vbmap(
        &self,
        pool: &str,
        bucket: &str,
        kvaddrs: &[String],
    ) -> Result<VbmapResponse, Error> {
        let resp = self
            .call(AdminRequest::GetVbmap {
                pool: pool.to_string(),
                bucket: bucket.to_string(),
                kvaddrs: kvaddrs.to_vec(),
            })
            .await?;
        match resp {
            AdminResponse::Vbmap(vbmap) => Ok(vbmap),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_failover_logs(
        &self,
        pool: &str,
        bucket: &str,
        vbnos: &[Vbno],
    ) -> Result<BTreeMap<Vbno, FailoverLog>, Error> {
        let resp = self
            .call(AdminRequest::GetFailoverLogs {
                pool: pool.to_string(),
                bucket: bucket.to_string(),
                vbnos: vbnos.to_vec(),
            })
            .await?;
        match resp {
            AdminResponse::FailoverLogs(flogs) => Ok(flogs),
            other => Err(unexpected(other)),
        }
    }

    /// Start a topic streaming every vbucket of the instances' buckets from
    /// seqno zero on the newest branch.
    pub async fn initial_topic_request(
        &self,
        topic: &str,
        pool: &str,
        endpoint_type: &str,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        let buckets: BTreeSet<String> =
            instances.iter().map(|inst| inst.bucket.clone()).collect();
        let mut req_ts = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            req_ts.push(self.initial_restart_timestamp(pool, &bucket).await?);
        }
        self.mutation_topic_request(topic, endpoint_type, req_ts, instances)
            .await
    }

    /// Start or update a topic with explicit restart timestamps.
    pub async fn mutation_topic_request(
        &self,
        topic: &str,
        endpoint_type: &str,
        req_timestamps: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        let resp = self
            .call(AdminRequest::MutationTopic {
                topic: topic.to_string(),
                endpoint_type: endpoint_type.to_string(),
                req_timestamps,
                instances,
            })
            .await?;
        topic_result(resp)
    }

    /// Restart streams for vbuckets that are neither active nor outstanding.
    pub async fn restart_vbuckets(
        &self,
        topic: &str,
        restart_timestamps: Vec<TsVbuuid>,
    ) -> Result<TopicResponse, Error> {
        let resp = self
            .call(AdminRequest::RestartVbuckets {
                topic: topic.to_string(),
                restart_timestamps,
            })
            .await?;
        topic_result(resp)
    }

    pub async fn shutdown_vbuckets(
        &self,
        topic: &str,
        shutdown_timestamps: Vec<TsVbuuid>,
    ) -> Result<(), Error> {
        let resp = self
            .call(AdminRequest::ShutdownVbuckets {
                topic: topic.to_string(),
                shutdown_timestamps,
            })
            .await?;
        error_result(resp)
    }

    pub async fn add_buckets(
        &self,
        topic: &str,
        req_timestamps: Vec<TsVbuuid>,
        instances: Vec<Instance>,
    ) -> Result<TopicResponse, Error> {
        let resp = self
            .call(AdminRequest::AddBuckets {
                topic: topic.to_string(),
                req_timestamps,
                instances,
            })
            .await?;
        topic_result(resp)
    }

    pub async fn del_buckets(&self, topic: &str, buckets: Vec<String>) -> Result<(), Error> {
        let resp = self
            .call(AdminRequest::DelBuckets {
                topic: topic.to_string(),
                buckets,
            })
            .await?;
        error_result(resp)
    }

    pub async fn add_instances(
        &self,
        topic: &str,
        instances: Vec<Instance>,
    ) -> Result<(), Error> {
        let resp = self
            .call(AdminRequest::AddInstances {
                topic: topic.to_string(),
                instances,
            })
            .await?;
        error_result(resp)
    }

    pub async fn del_instances(&self, topic: &str, uuids: Vec<u64>) -> Result<(), Error> {
        let resp = self
            .call(AdminRequest::DelInstances {
                topic: topic.to_string(),
                uuids,
            })
            .await?;
        error_result(resp)
    }

    /// Reopen endpoints that experienced transient connection problems.
    pub async fn repair_endpoints(
        &self,
        topic: &str,
        endpoints: Vec<String>,
    ) -> Result<(), Error> {
        let resp = self
            .call(AdminRequest::RepairEndpoints {
                topic: topic.to_string(),
                endpoints,
            })
            .await?;
        error_result(resp)
    }

    pub async fn shutdown_topic(&self, topic: &str) -> Result<(), Error> {
        let resp = self
            .call(AdminRequest::ShutdownTopic {
                topic: topic.to_string(),
            })
            .await?;
        error_result(resp)
    }

    /// Compose the initial restart timestamp for `bucket`: the vbmap crossed
    /// with each vbucket's newest failover-log entry at seqno zero.
    pub async fn initial_restart_timestamp(
        &self,
        pool: &str,
        bucket: &str,
    ) -> Result<TsVbuuid, Error> {
        let vbmap = self.get_vbmap(pool, bucket, &[]).await?;
        let vbnos: Vec<Vbno> = vbmap.kvmap.values().flatten().copied().collect();
        let flogs = self.get_failover_logs(pool, bucket, &vbnos).await?;
        TsVbuuid::new(pool, bucket, self.max_vbuckets).initial_restart_ts(&flogs)
    }

    /// Issue one request with the retry policy applied.
    async fn call(&self, req: AdminRequest) -> Result<AdminResponse, Error> {
        let mut interval = self.retry_interval_ms;
        let mut retries_left = self.max_retries;
        loop {
            let outcome =
                match tokio::time::timeout(self.response_timeout, self.transport.request(req.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::ResponseTimeout),
                };
            let err = match outcome {
                Ok(AdminResponse::Error(Some(err))) => err,
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            if !err.is_connection_refused() || self.retry_interval_ms == 0 {
                return Err(err);
            }
            if self.max_retries > 0 {
                retries_left -= 1;
                if retries_left == 0 {
                    return Err(err);
                }
            }
            tracing::debug!(interval_ms = interval, "retrying admin request");
            tokio::time::sleep(Duration::from_millis(interval)).await;
            if self.exp_backoff > 0 {
                interval *= self.exp_backoff;
            }
        }
    }
}

fn topic_result(resp: AdminResponse) -> Result<TopicResponse, Error> {
    match resp {
        AdminResponse::Topic(topic) => match topic.err {
            Some(err) => Err(err),
            None => Ok(topic),
        },
        other => Err(unexpected(other)),
    }
}

fn error_result(resp: AdminResponse) -> Result<(), Error> {
    match resp {
        AdminResponse::Error(None) => Ok(()),
        AdminResponse::Error(Some(err)) => Err(err),
        other => Err(unexpected(other)),
    }
}

fn unexpected(resp: AdminResponse) -> Error {
    Error::Transport(format!("unexpected response shape: {resp:?}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use spindle_common::ClientConfig;
    use tokio::time::Instant;

    use super::*;

    /// Fails the first `failures` calls with connection-refused, then
    /// succeeds with an empty error envelope.
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
        error: Error,
    }

    impl FlakyTransport {
        fn refused(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                error: Error::connection_refused(),
            }
        }
    }

    #[async_trait]
    impl AdminTransport for FlakyTransport {
        async fn request(&self, _req: AdminRequest) -> Result<AdminResponse, Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(AdminResponse::Error(None))
            }
        }
    }

    /// Never completes; used to exercise the response timeout.
    struct StuckTransport;

    #[async_trait]
    impl AdminTransport for StuckTransport {
        async fn request(&self, _req: AdminRequest) -> Result<AdminResponse, Error> {
            std::future::pending().await
        }
    }

    fn config(retry_interval_ms: u64, max_retries: u32, exponential_backoff: u64) -> Config {
        Config {
            client: ClientConfig {
                retry_interval_ms,
                max_retries,
                exponential_backoff,
            },
            ..Config::default()
        }
    }

    fn shutdown_req() -> AdminRequest {
        AdminRequest::ShutdownTopic {
            topic: "t".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connection_refused_with_exponential_backoff() {
        let transport = Arc::new(FlakyTransport::refused(2));
        let client = Client::new(transport.clone(), &config(100, 3, 2));

        let started = Instant::now();
        client.call(shutdown_req()).await.unwrap();

        // Two retries: 100ms then 200ms.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn max_retries_bounds_the_attempts() {
        let transport = Arc::new(FlakyTransport::refused(u32::MAX));
        let client = Client::new(transport.clone(), &config(10, 3, 0));

        let err = client.call(shutdown_req()).await.unwrap_err();
        assert!(err.is_connection_refused());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn semantic_errors_are_not_retried() {
        let transport = Arc::new(FlakyTransport {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: Error::TopicMissing,
        });
        let client = Client::new(transport.clone(), &config(10, 5, 2));

        let err = client.call(shutdown_req()).await.unwrap_err();
        assert_eq!(err, Error::TopicMissing);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_interval_disables_retry() {
        let transport = Arc::new(FlakyTransport::refused(u32::MAX));
        let client = Client::new(transport.clone(), &config(0, 5, 2));

        let err = client.call(shutdown_req()).await.unwrap_err();
        assert!(err.is_connection_refused());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_is_never_retried() {
        let client = Client::new(Arc::new(StuckTransport), &config(10, 5, 2));
        let err = client.call(shutdown_req()).await.unwrap_err();
        assert_eq!(err, Error::ResponseTimeout);
    }
}
