//! Domain error kinds.
//!
//! The admin client classifies these: only transport failures that look like
//! connection-refused are retried; semantic errors and response timeouts are
//! returned to the caller as-is.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// Connection refused / reset and friends. Retriable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Request did not complete within the response timeout. Never retried.
    #[error("response timeout")]
    ResponseTimeout,

    /// Malformed feed request, e.g. a bucket with zero instances.
    #[error("inconsistent feed request")]
    InconsistentFeed,

    /// Projector could not find a colocated kv host.
    #[error("invalid kv addresses")]
    InvalidKvAddrs,

    /// Vbuuid in the request does not match any known branch.
    #[error("invalid vbucket branch")]
    InvalidVbucketBranch,

    /// Vbucket moved; the caller must refresh its vbmap.
    #[error("not my vbucket")]
    NotMyVbucket,

    /// Topic is not started; the caller must reissue MutationTopic.
    #[error("topic missing")]
    TopicMissing,

    /// Bucket is not part of the feed.
    #[error("invalid bucket: {0}")]
    InvalidBucket(String),

    /// Upstream connection closed; the bucket must be re-added.
    #[error("upstream feeder failure for bucket {0}")]
    Feeder(String),

    #[error("stream request failed for vbucket {0}")]
    StreamRequest(u16),

    #[error("stream end failed for vbucket {0}")]
    StreamEnd(u16),

    #[error("empty failover log")]
    EmptyFailoverLog,

    /// No feasible placement; the message names the violated constraint.
    #[error("no feasible placement: {0}")]
    PlanInfeasible(String),

    /// The serving task shut down while the request was pending.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// The one condition the admin client retries on.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::Transport(msg) if msg.contains("connection refused"))
    }

    pub fn connection_refused() -> Self {
        Error::Transport("connection refused".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_refused_transport_errors_are_retriable() {
        assert!(Error::connection_refused().is_connection_refused());
        assert!(!Error::Transport("connection reset by peer".into()).is_connection_refused());
        assert!(!Error::ResponseTimeout.is_connection_refused());
        assert!(!Error::TopicMissing.is_connection_refused());
    }
}
