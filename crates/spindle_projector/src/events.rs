//! Upstream change-stream events.
//!
//! One serialized stream of these per (bucket, kv-node); the kv data path
//! scatters them to per-vbucket routines by vbucket number.

use bytes::Bytes;
use spindle_common::ts::FailoverLog;
use spindle_common::{Seqno, Vbno, Vbuuid};

/// Event kinds observed on an upstream stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UprOpcode {
    StreamRequest,
    StreamEnd,
    Mutation,
    Deletion,
    Expiration,
    Snapshot,
}

/// Outcome attached to StreamRequest / StreamEnd events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Success,
    /// The requested (vbuuid, seqno) is off-branch; the vbucket must rewind.
    Rollback,
    Error,
}

/// A single upstream event for one vbucket.
#[derive(Clone, Debug)]
pub struct UprEvent {
    pub opcode: UprOpcode,
    pub status: StreamStatus,
    pub vbno: Vbno,
    pub vbuuid: Vbuuid,
    /// Mutation seqno; for StreamRequest(Rollback) the rollback seqno.
    pub seqno: Seqno,
    pub snap_start: Seqno,
    pub snap_end: Seqno,
    pub key: Bytes,
    pub value: Bytes,
    /// Present on StreamRequest responses.
    pub failover_log: Option<FailoverLog>,
}

impl UprEvent {
    fn base(opcode: UprOpcode, vbno: Vbno) -> Self {
        Self {
            opcode,
            status: StreamStatus::Success,
            vbno,
            vbuuid: 0,
            seqno: 0,
            snap_start: 0,
            snap_end: 0,
            key: Bytes::new(),
            value: Bytes::new(),
            failover_log: None,
        }
    }

    pub fn stream_request(vbno: Vbno, flog: FailoverLog) -> Self {
        let mut e = Self::base(UprOpcode::StreamRequest, vbno);
        e.failover_log = Some(flog);
        e
    }

    pub fn stream_request_rollback(vbno: Vbno, rollback_seqno: Seqno) -> Self {
        let mut e = Self::base(UprOpcode::StreamRequest, vbno);
        e.status = StreamStatus::Rollback;
        e.seqno = rollback_seqno;
        e
    }

    pub fn stream_request_error(vbno: Vbno) -> Self {
        let mut e = Self::base(UprOpcode::StreamRequest, vbno);
        e.status = StreamStatus::Error;
        e
    }

    pub fn stream_end(vbno: Vbno) -> Self {
        Self::base(UprOpcode::StreamEnd, vbno)
    }

    pub fn mutation(vbno: Vbno, seqno: Seqno, key: Bytes, value: Bytes) -> Self {
        let mut e = Self::base(UprOpcode::Mutation, vbno);
        e.seqno = seqno;
        e.key = key;
        e.value = value;
        e
    }

    pub fn deletion(vbno: Vbno, seqno: Seqno, key: Bytes) -> Self {
        let mut e = Self::base(UprOpcode::Deletion, vbno);
        e.seqno = seqno;
        e.key = key;
        e
    }

    pub fn snapshot(vbno: Vbno, snap_start: Seqno, snap_end: Seqno) -> Self {
        let mut e = Self::base(UprOpcode::Snapshot, vbno);
        e.snap_start = snap_start;
        e.snap_end = snap_end;
        e
    }
}
