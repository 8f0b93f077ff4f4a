//! Shared types for the spindle secondary-indexing subsystem.
//!
//! This crate carries the vocabulary both halves of the system speak:
//! restart timestamps and failover logs for the projector feed engine, the
//! domain error kinds the admin client classifies, and the runtime
//! configuration surface.

pub mod config;
pub mod error;
pub mod stats;
pub mod ts;

pub use config::{ClientConfig, Config};
pub use error::Error;
pub use stats::Statistics;
pub use ts::{FailoverLog, TsEntry, TsVbuuid};

/// Hash-partition number of a bucket's keyspace; the stream unit.
pub type Vbno = u16;
/// Mutation sequence number within one vbucket.
pub type Seqno = u64;
/// Branch identifier for a vbucket's history; mismatch triggers rollback.
pub type Vbuuid = u64;
