//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Configuration consumed by the projector core and its admin client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of vbuckets each bucket is partitioned into.
    pub max_vbuckets: usize,
    /// URL prefix for adminport endpoints.
    pub adminport_url_prefix: String,
    /// Per-request response timeout in milliseconds.
    pub response_timeout_ms: u64,
    /// Admin-client retry policy.
    pub client: ClientConfig,
}

/// Retry policy for the admin client.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sleep between retries, in milliseconds. Zero disables retry.
    pub retry_interval_ms: u64,
    /// Attempt budget. Zero retries indefinitely.
    pub max_retries: u32,
    /// Interval multiplier applied after each retry. Zero disables backoff.
    pub exponential_backoff: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            adminport_url_prefix: "adminport/".to_string(),
            response_timeout_ms: 10_000,
            client: ClientConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 100,
            max_retries: 5,
            exponential_backoff: 2,
        }
    }
}
