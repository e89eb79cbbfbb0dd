//! Document adapter over the key-value capability.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Free-form source metadata attached to a document.
pub type Metadata = HashMap<String, serde_json::Value>;

const DOC_PREFIX: &str = "doc/";

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Wall-clock insertion time in milliseconds since the Unix epoch.
    pub stored_at: u64,
}

/// Durable document lookups and writes keyed by document id.
///
/// Translates engine absence into [`Error::NotFound`] and every other engine
/// or decoding failure into [`Error::StoreUnavailable`]. Holds no cache.
#[derive(Clone)]
pub struct ContextStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ContextStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(doc_id: &str) -> Vec<u8> {
        format!("{}{}", DOC_PREFIX, doc_id).into_bytes()
    }

    /// Fetch a document by id.
    pub async fn get(&self, doc_id: &str) -> Result<Document> {
        let bytes = self
            .kv
            .get(&Self::key(doc_id))
            .await
            .map_err(into_store_error)?
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))?;
        decode(&bytes)
    }

    /// Store a document, replacing any previous version, and return it.
    pub async fn put(
        &self,
        doc_id: &str,
        text: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Document> {
        let document = Document {
            id: doc_id.to_string(),
            text: text.into(),
            metadata,
            stored_at: now_millis(),
        };
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| Error::StoreUnavailable(format!("encode {}: {}", doc_id, e)))?;
        self.kv
            .put(&Self::key(doc_id), bytes)
            .await
            .map_err(into_store_error)?;
        Ok(document)
    }

    /// Remove a document. Absence is reported as [`Error::NotFound`].
    pub async fn delete(&self, doc_id: &str) -> Result<()> {
        let existed = self
            .kv
            .delete(&Self::key(doc_id))
            .await
            .map_err(into_store_error)?;
        if existed {
            Ok(())
        } else {
            Err(Error::NotFound(doc_id.to_string()))
        }
    }

    /// Ids of every stored document, in key order.
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let entries = self
            .kv
            .scan_prefix(DOC_PREFIX.as_bytes())
            .await
            .map_err(into_store_error)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| {
                String::from_utf8(key[DOC_PREFIX.len()..].to_vec()).ok()
            })
            .collect())
    }
}

fn decode(bytes: &[u8]) -> Result<Document> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::StoreUnavailable(format!("corrupt document record: {}", e)))
}

fn into_store_error(err: Error) -> Error {
    match err {
        Error::StoreUnavailable(_) | Error::NotFound(_) => err,
        other => Error::StoreUnavailable(other.to_string()),
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
