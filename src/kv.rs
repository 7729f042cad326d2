/// Ordered byte-key/byte-value store contract, plus two implementations:
/// `RocksKv` over the real `rocksdb` crate (a single keyspace, no column
/// families, matching the flat key layout this indexer persists), and an
/// in-memory `MemKv` for fast unit tests that don't want to touch disk.
/// Grounded in the teacher's `db_utils.rs`/`db_handles.rs` async-wrapper
/// idiom, minus the column-family indirection this design doesn't need.
use crate::error::{IndexError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub trait KvBatch: Send + std::any::Any {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
    fn as_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Ascending iteration over all keys sharing `prefix`.
    async fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn new_batch(&self) -> Box<dyn KvBatch>;
    async fn commit(&self, batch: Box<dyn KvBatch>) -> Result<()>;
}

pub struct RocksKv {
    db: Arc<rocksdb::DB>,
}

impl RocksKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(256 * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.set_max_background_jobs(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = rocksdb::DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }
}

pub struct RocksBatch {
    batch: rocksdb::WriteBatch,
}

impl KvBatch for RocksBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.batch.put(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.batch.delete(key);
    }

    fn as_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[async_trait::async_trait]
impl KvStore for RocksKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || db.get(key).map_err(IndexError::from))
            .await
            .map_err(|e| IndexError::CorruptIndex(e.to_string()))?
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || db.put(key, value).map_err(IndexError::from))
            .await
            .map_err(|e| IndexError::CorruptIndex(e.to_string()))?
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || db.delete(key).map_err(IndexError::from))
            .await
            .map_err(|e| IndexError::CorruptIndex(e.to_string()))?
    }

    async fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.db.clone();
        let prefix = prefix.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let iter = db.prefix_iterator(&prefix);
            for item in iter {
                let (k, v) = item.map_err(IndexError::from)?;
                if !k.starts_with(&prefix) {
                    break;
                }
                out.push((k.to_vec(), v.to_vec()));
            }
            Ok(out)
        })
        .await
        .map_err(|e| IndexError::CorruptIndex(e.to_string()))?
    }

    fn new_batch(&self) -> Box<dyn KvBatch> {
        Box::new(RocksBatch { batch: rocksdb::WriteBatch::default() })
    }

    async fn commit(&self, batch: Box<dyn KvBatch>) -> Result<()> {
        let db = self.db.clone();
        let raw = batch
            .as_any()
            .downcast::<RocksBatch>()
            .map_err(|_| IndexError::CorruptIndex("batch from a different KvStore impl".into()))?;
        tokio::task::spawn_blocking(move || db.write(raw.batch).map_err(IndexError::from))
            .await
            .map_err(|e| IndexError::CorruptIndex(e.to_string()))?
    }
}

enum MemOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub struct MemBatch {
    ops: Vec<MemOp>,
}

impl KvBatch for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(MemOp::Put(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(MemOp::Delete(key.to_vec()));
    }

    fn as_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

/// `BTreeMap`-backed store for tests: same ordering and prefix-iteration
/// semantics as `RocksKv`, without spinning up a real database.
#[derive(Default)]
pub struct MemKv {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self { map: Mutex::new(BTreeMap::new()) }
    }
}

#[async_trait::async_trait]
impl KvStore for MemKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    async fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock().unwrap();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn new_batch(&self) -> Box<dyn KvBatch> {
        Box::new(MemBatch { ops: Vec::new() })
    }

    async fn commit(&self, batch: Box<dyn KvBatch>) -> Result<()> {
        let raw = batch
            .as_any()
            .downcast::<MemBatch>()
            .map_err(|_| IndexError::CorruptIndex("batch from a different KvStore impl".into()))?;
        let mut map = self.map.lock().unwrap();
        for op in raw.ops {
            match op {
                MemOp::Put(k, v) => {
                    map.insert(k, v);
                }
                MemOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let kv = MemKv::new();
        kv.put(b"a", b"1").await.unwrap();
        assert_eq!(kv.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        kv.delete(b"a").await.unwrap();
        assert_eq!(kv.get(b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_iteration_is_ascending_and_bounded() {
        let kv = MemKv::new();
        kv.put(b"h\x00\x01", b"x").await.unwrap();
        kv.put(b"h\x00\x02", b"y").await.unwrap();
        kv.put(b"u\x00\x01", b"z").await.unwrap();

        let found = kv.iter_prefix(b"h").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, b"h\x00\x01");
        assert_eq!(found[1].0, b"h\x00\x02");
    }

    #[tokio::test]
    async fn batch_commit_applies_atomically() {
        let kv = MemKv::new();
        let mut batch = kv.new_batch();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        kv.commit(batch).await.unwrap();
        assert_eq!(kv.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    }
}
