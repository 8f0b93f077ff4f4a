//! Restart timestamps and failover logs.
//!
//! A `TsVbuuid` is the per-bucket restart timestamp: one optional entry per
//! vbucket, sized to the configured maximum. Absent entries mean the vbucket
//! was not requested. Two timestamps combine by entry-wise replacement.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::{Seqno, Vbno, Vbuuid};

/// Position of one vbucket inside a restart timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsEntry {
    pub vbuuid: Vbuuid,
    pub seqno: Seqno,
    pub snap_start: Seqno,
    pub snap_end: Seqno,
}

/// Per-bucket restart timestamp covering the full vbucket set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsVbuuid {
    pub pool: String,
    pub bucket: String,
    entries: Vec<Option<TsEntry>>,
}

impl TsVbuuid {
    /// Empty timestamp sized for `max_vbuckets`.
    pub fn new(pool: &str, bucket: &str, max_vbuckets: usize) -> Self {
        Self {
            pool: pool.to_string(),
            bucket: bucket.to_string(),
            entries: vec![None; max_vbuckets],
        }
    }

    pub fn max_vbuckets(&self) -> usize {
        self.entries.len()
    }

    /// Number of vbuckets present in this timestamp.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    pub fn get(&self, vbno: Vbno) -> Option<&TsEntry> {
        self.entries.get(vbno as usize).and_then(|e| e.as_ref())
    }

    pub fn set(&mut self, vbno: Vbno, entry: TsEntry) {
        if let Some(slot) = self.entries.get_mut(vbno as usize) {
            *slot = Some(entry);
        }
    }

    pub fn remove(&mut self, vbno: Vbno) -> Option<TsEntry> {
        self.entries.get_mut(vbno as usize).and_then(|e| e.take())
    }

    pub fn contains(&self, vbno: Vbno) -> bool {
        self.get(vbno).is_some()
    }

    /// Requested start seqno for `vbno`, zero when absent.
    pub fn seqno_for(&self, vbno: Vbno) -> Seqno {
        self.get(vbno).map(|e| e.seqno).unwrap_or(0)
    }

    /// Vbuckets present in this timestamp, ascending.
    pub fn vbnos(&self) -> Vec<Vbno> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i as Vbno))
            .collect()
    }

    /// Entry-wise union: entries present in `other` replace ours.
    pub fn union(&self, other: &TsVbuuid) -> TsVbuuid {
        let mut out = self.clone();
        let n = out.entries.len().min(other.entries.len());
        for vbno in 0..n {
            if let Some(entry) = other.entries[vbno] {
                out.entries[vbno] = Some(entry);
            }
        }
        out
    }

    /// Restrict this timestamp to the listed vbuckets.
    pub fn filter_vbuckets(&self, vbnos: &[Vbno]) -> TsVbuuid {
        let mut out = TsVbuuid::new(&self.pool, &self.bucket, self.entries.len());
        for &vbno in vbnos {
            if let Some(entry) = self.get(vbno) {
                out.set(vbno, *entry);
            }
        }
        out
    }

    /// Compose the initial restart timestamp for a bucket: every vbucket
    /// with a failover log starts from seqno zero on the newest branch.
    pub fn initial_restart_ts(
        mut self,
        flogs: &BTreeMap<Vbno, FailoverLog>,
    ) -> Result<TsVbuuid, Error> {
        for (&vbno, flog) in flogs {
            let (vbuuid, _) = flog.latest()?;
            self.set(
                vbno,
                TsEntry {
                    vbuuid,
                    seqno: 0,
                    snap_start: 0,
                    snap_end: 0,
                },
            );
        }
        Ok(self)
    }
}

/// Ordered history of a vbucket's (vbuuid, seqno) pairs, newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverLog(pub Vec<(Vbuuid, Seqno)>);

impl FailoverLog {
    /// The newest branch, used when composing an initial restart timestamp.
    pub fn latest(&self) -> Result<(Vbuuid, Seqno), Error> {
        self.0.first().copied().ok_or(Error::EmptyFailoverLog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_with(entries: &[(Vbno, Seqno)]) -> TsVbuuid {
        let mut ts = TsVbuuid::new("default", "default", 64);
        for &(vbno, seqno) in entries {
            ts.set(
                vbno,
                TsEntry {
                    vbuuid: 1000 + vbno as Vbuuid,
                    seqno,
                    snap_start: 0,
                    snap_end: seqno,
                },
            );
        }
        ts
    }

    #[test]
    fn union_replaces_entry_wise() {
        let a = ts_with(&[(1, 10), (2, 20)]);
        let b = ts_with(&[(2, 200), (3, 30)]);
        let u = a.union(&b);
        assert_eq!(u.seqno_for(1), 10);
        assert_eq!(u.seqno_for(2), 200);
        assert_eq!(u.seqno_for(3), 30);
        assert_eq!(u.len(), 3);
    }

    #[test]
    fn filter_keeps_only_listed_vbuckets() {
        let ts = ts_with(&[(1, 10), (2, 20), (3, 30)]);
        let f = ts.filter_vbuckets(&[2, 5]);
        assert_eq!(f.vbnos(), vec![2]);
        assert_eq!(f.seqno_for(2), 20);
        assert_eq!(f.max_vbuckets(), ts.max_vbuckets());
    }

    #[test]
    fn initial_restart_ts_uses_newest_branch_at_seqno_zero() {
        let mut flogs = BTreeMap::new();
        flogs.insert(7, FailoverLog(vec![(99, 500), (42, 100)]));
        let ts = TsVbuuid::new("default", "default", 16)
            .initial_restart_ts(&flogs)
            .unwrap();
        let entry = ts.get(7).unwrap();
        assert_eq!(entry.vbuuid, 99);
        assert_eq!(entry.seqno, 0);
        assert_eq!((entry.snap_start, entry.snap_end), (0, 0));
    }

    #[test]
    fn empty_failover_log_is_an_error() {
        let mut flogs = BTreeMap::new();
        flogs.insert(0, FailoverLog(Vec::new()));
        let err = TsVbuuid::new("default", "default", 4)
            .initial_restart_ts(&flogs)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyFailoverLog));
    }
}
