//! Loosely-typed statistics maps exchanged over control channels.

use serde_json::{Map, Value};

/// Statistics payload: a JSON object of counters and nested maps.
pub type Statistics = Map<String, Value>;

/// Build a statistics map from key/value pairs.
pub fn statistics<I, K>(pairs: I) -> Statistics
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
