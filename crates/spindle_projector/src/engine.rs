//! Engines: the (evaluator, router) pair attached to an index instance.
//!
//! An engine transforms a KV document into an index entry and picks the
//! endpoints the entry is shipped to. Engines are immutable after creation
//! and shared by reference across all vbucket routines of their bucket.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spindle_common::Error;

/// Transforms a document into an index key. `None` means the document does
/// not contribute an entry for this index.
pub trait Evaluator: Send + Sync {
    fn index_key(&self, doc_key: &[u8], doc_value: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

/// Chooses downstream endpoints for a computed key.
pub trait Router: Send + Sync {
    fn endpoints(&self, partition_key: &[u8]) -> Vec<String>;
}

/// Evaluator + router for one index instance, keyed by instance uuid.
#[derive(Clone)]
pub struct Engine {
    uuid: u64,
    bucket: String,
    evaluator: Arc<dyn Evaluator>,
    router: Arc<dyn Router>,
}

impl Engine {
    pub fn new(
        uuid: u64,
        bucket: String,
        evaluator: Arc<dyn Evaluator>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            uuid,
            bucket,
            evaluator,
            router,
        }
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Evaluate a mutation: the produced index key plus the endpoints it
    /// routes to.
    pub fn transform(
        &self,
        doc_key: &[u8],
        doc_value: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<String>)>, Error> {
        let Some(index_key) = self.evaluator.index_key(doc_key, doc_value)? else {
            return Ok(None);
        };
        let raddrs = self.router.endpoints(&index_key);
        Ok(Some((index_key, raddrs)))
    }

    /// Endpoints a deletion for `doc_key` routes to.
    pub fn route_deletion(&self, doc_key: &[u8]) -> Vec<String> {
        self.router.endpoints(doc_key)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("uuid", &self.uuid)
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Wire-level description of an index instance, expanded into an [`Engine`]
/// by the feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: u64,
    pub bucket: String,
    /// JSON fields composing the secondary key; ignored for primary indexes.
    pub fields: Vec<String>,
    pub is_primary: bool,
    /// Remote addresses of the downstream endpoints.
    pub endpoints: Vec<String>,
}

impl Instance {
    pub fn to_engine(&self) -> Engine {
        let evaluator: Arc<dyn Evaluator> = Arc::new(JsonEvaluator {
            fields: self.fields.clone(),
            is_primary: self.is_primary,
        });
        let router: Arc<dyn Router> = Arc::new(HashRouter {
            endpoints: self.endpoints.clone(),
        });
        Engine::new(self.uuid, self.bucket.clone(), evaluator, router)
    }
}

/// Extracts named JSON fields into a composite key. A primary-index
/// evaluator emits the document key itself.
pub struct JsonEvaluator {
    pub fields: Vec<String>,
    pub is_primary: bool,
}

impl Evaluator for JsonEvaluator {
    fn index_key(&self, doc_key: &[u8], doc_value: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if self.is_primary {
            return Ok(Some(doc_key.to_vec()));
        }
        let doc: Value = match serde_json::from_slice(doc_value) {
            Ok(doc) => doc,
            // Non-JSON documents are not indexable; skip rather than fail
            // the stream.
            Err(_) => return Ok(None),
        };
        let mut composite = Vec::with_capacity(self.fields.len());
        let mut all_missing = true;
        for field in &self.fields {
            match doc.get(field) {
                Some(v) => {
                    all_missing = false;
                    composite.push(v.clone());
                }
                None => composite.push(Value::Null),
            }
        }
        if all_missing {
            return Ok(None);
        }
        let key = serde_json::to_vec(&Value::Array(composite))
            .map_err(|e| Error::Transport(format!("key encode: {e}")))?;
        Ok(Some(key))
    }
}

/// Routes a key to one of the configured endpoints by key hash.
pub struct HashRouter {
    pub endpoints: Vec<String>,
}

impl Router for HashRouter {
    fn endpoints(&self, partition_key: &[u8]) -> Vec<String> {
        if self.endpoints.is_empty() {
            return Vec::new();
        }
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        let pick = hasher.finish() as usize % self.endpoints.len();
        vec![self.endpoints[pick].clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(fields: &[&str], primary: bool) -> Instance {
        Instance {
            uuid: 7,
            bucket: "default".into(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
            is_primary: primary,
            endpoints: vec!["indexer-1:9100".into(), "indexer-2:9100".into()],
        }
    }

    #[test]
    fn secondary_key_is_composite_of_fields() {
        let engine = instance(&["city", "age"], false).to_engine();
        let doc = br#"{"city":"lisbon","age":33,"name":"ana"}"#;
        let (key, raddrs) = engine.transform(b"u1", doc).unwrap().unwrap();
        assert_eq!(key, br#"["lisbon",33]"#.to_vec());
        assert_eq!(raddrs.len(), 1);
    }

    #[test]
    fn missing_fields_become_null_and_all_missing_skips() {
        let engine = instance(&["city", "age"], false).to_engine();
        let (key, _) = engine
            .transform(b"u1", br#"{"city":"porto"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(key, br#"["porto",null]"#.to_vec());
        assert!(engine.transform(b"u1", br#"{"name":"ana"}"#).unwrap().is_none());
    }

    #[test]
    fn primary_engine_emits_doc_key() {
        let engine = instance(&[], true).to_engine();
        let (key, _) = engine.transform(b"u1", b"not-json").unwrap().unwrap();
        assert_eq!(key, b"u1".to_vec());
    }

    #[test]
    fn hash_router_is_deterministic_per_key() {
        let router = HashRouter {
            endpoints: vec!["a".into(), "b".into(), "c".into()],
        };
        let first = router.endpoints(b"k1");
        for _ in 0..8 {
            assert_eq!(router.endpoints(b"k1"), first);
        }
    }
}
