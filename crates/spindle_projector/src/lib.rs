//! Projector feed engine.
//!
//! A projector attaches to per-node upstream change streams, evaluates index
//! expressions against each mutation, and scatters the transformed entries to
//! downstream indexer endpoints. Control flows top-down (admin client -> feed
//! -> kv data path -> vbucket routine) over bounded command channels with
//! oneshot replies; data flows bottom-up from the upstream event stream to
//! the endpoints, one owning task per vbucket.

pub mod client;
pub mod endpoint;
pub mod engine;
pub mod events;
pub mod feed;
pub mod kvdata;
pub mod projector;
pub mod sim;
pub mod transport;
pub mod vbucket;

pub use client::Client;
pub use endpoint::{DataportPayload, EndpointFactory, RouterEndpoint};
pub use engine::{Engine, Evaluator, Instance, Router};
pub use events::{StreamStatus, UprEvent, UprOpcode};
pub use feed::{Feed, TopicResponse};
pub use projector::{BucketFeeder, FeederFactory, KvCluster, Projector};
pub use transport::{AdminRequest, AdminResponse, AdminTransport, LocalTransport, VbmapResponse};
