//! Downstream endpoints: bounded sinks for routed mutations.
//!
//! An endpoint is an opaque sink identified by remote address. Sends never
//! block the vbucket routine: the queue is bounded and an overflowing
//! mutation is dropped and counted, preserving freshness of the live stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use spindle_common::{Error, Seqno, Vbno, Vbuuid};
use tokio::sync::mpsc;

/// Capacity of each endpoint's send queue.
pub const ENDPOINT_QUEUE_CAPACITY: usize = 1024;

/// Payloads shipped to a downstream indexer endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataportPayload {
    StreamBegin {
        bucket: String,
        vbno: Vbno,
        vbuuid: Vbuuid,
    },
    Mutation {
        bucket: String,
        vbno: Vbno,
        seqno: Seqno,
        instance_uuid: u64,
        index_key: Vec<u8>,
        doc_key: Bytes,
    },
    Deletion {
        bucket: String,
        vbno: Vbno,
        seqno: Seqno,
        instance_uuid: u64,
        doc_key: Bytes,
    },
    Snapshot {
        bucket: String,
        vbno: Vbno,
        snap_start: Seqno,
        snap_end: Seqno,
    },
    StreamEnd {
        bucket: String,
        vbno: Vbno,
    },
}

/// Opens endpoints for a feed. Endpoints are opened lazily, on the first
/// engine that routes to the address.
pub trait EndpointFactory: Send + Sync {
    fn open(&self, topic: &str, raddr: &str) -> Result<RouterEndpoint, Error>;
}

/// Handle to one downstream sink. Cloned into every vbucket routine that
/// routes to it; dropping the last clone closes the sink.
#[derive(Clone)]
pub struct RouterEndpoint {
    raddr: String,
    tx: mpsc::Sender<DataportPayload>,
    dropped: Arc<AtomicU64>,
}

impl RouterEndpoint {
    pub fn new(raddr: &str, tx: mpsc::Sender<DataportPayload>) -> Self {
        Self {
            raddr: raddr.to_string(),
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Endpoint plus the receiving half, for sinks that drain in-process.
    pub fn pair(raddr: &str) -> (Self, mpsc::Receiver<DataportPayload>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE_CAPACITY);
        (Self::new(raddr, tx), rx)
    }

    pub fn raddr(&self) -> &str {
        &self.raddr
    }

    /// Non-blocking send. Returns false when the payload was dropped, either
    /// on overflow or because the sink has closed.
    pub fn send(&self, payload: DataportPayload) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Payloads dropped on overflow since the endpoint was opened.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RouterEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterEndpoint")
            .field("raddr", &self.raddr)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(seqno: Seqno) -> DataportPayload {
        DataportPayload::Mutation {
            bucket: "default".into(),
            vbno: 0,
            seqno,
            instance_uuid: 1,
            index_key: vec![],
            doc_key: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(2);
        let ep = RouterEndpoint::new("indexer-1:9100", tx);
        assert!(ep.send(mutation(1)));
        assert!(ep.send(mutation(2)));
        assert!(!ep.send(mutation(3)));
        assert!(!ep.send(mutation(4)));
        assert_eq!(ep.dropped(), 2);
    }

    #[tokio::test]
    async fn closed_sink_counts_as_drop() {
        let (ep, rx) = RouterEndpoint::pair("indexer-1:9100");
        drop(rx);
        assert!(!ep.send(mutation(1)));
        assert_eq!(ep.dropped(), 1);
    }
}
