//! Durable key-value capability and the document adapter built on it.
//!
//! The key-value engine is RocksDB; the [`ContextStore`] adapter layered on
//! top is the source of truth that vector index entries point into.

mod documents;

pub use documents::{ContextStore, Document, Metadata};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Byte-oriented key-value capability.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when the key is absent.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one.
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Remove a key. Returns whether it was present.
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// RocksDB-backed [`KeyValueStore`].
///
/// Engine calls block, so each one runs on the blocking thread pool.
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<rocksdb::DB>,
}

impl RocksDbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        let db = rocksdb::DB::open(&options, path)?;
        tracing::info!("Opened key-value store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rocksdb::DB) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl KeyValueStore for RocksDbStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = key.to_vec();
        self.blocking(move |db| Ok(db.get(&key)?)).await
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let key = key.to_vec();
        self.blocking(move |db| Ok(db.put(&key, value)?)).await
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        let key = key.to_vec();
        self.blocking(move |db| {
            let existed = db.get(&key)?.is_some();
            if existed {
                db.delete(&key)?;
            }
            Ok(existed)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = prefix.to_vec();
        self.blocking(move |db| {
            let mode = rocksdb::IteratorMode::From(prefix.as_slice(), rocksdb::Direction::Forward);
            let mut entries = Vec::new();
            for item in db.iterator(mode) {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                entries.push((key.to_vec(), value.to_vec()));
            }
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbStore::open(dir.path().join("db")).unwrap();

        assert!(store.get(b"a").await.unwrap().is_none());
        store.put(b"a", b"1".to_vec()).await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        assert!(store.delete(b"a").await.unwrap());
        assert!(!store.delete(b"a").await.unwrap());
        assert!(store.get(b"a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_prefix_stops_at_prefix_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbStore::open(dir.path().join("db")).unwrap();

        store.put(b"doc/b", b"2".to_vec()).await.unwrap();
        store.put(b"doc/a", b"1".to_vec()).await.unwrap();
        store.put(b"meta/x", b"9".to_vec()).await.unwrap();
        store.put(b"alpha", b"0".to_vec()).await.unwrap();

        let entries = store.scan_prefix(b"doc/").await.unwrap();
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"doc/a".as_slice(), b"doc/b".as_slice()]);
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksDbStore::open(&path).unwrap();
            store.put(b"k", b"durable".to_vec()).await.unwrap();
        }
        let reopened = RocksDbStore::open(&path).unwrap();
        assert_eq!(reopened.get(b"k").await.unwrap(), Some(b"durable".to_vec()));
    }
}
