//! In-memory ordered storage.

use crate::error::Result;
use crate::storage::{Storage, StorageFactory};
use crate::types::{BatchOp, Key, ReadOptions, SubnodeId, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Storage backed by a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Key, Value>>,

    reads: AtomicU64,
    writes: AtomicU64,
}

/// Storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub entry_count: usize,
    pub reads: u64,
    pub writes: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            entry_count: self.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.data.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.data.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.writes.fetch_add(ops.len() as u64, Ordering::Relaxed);
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate(&self, options: &ReadOptions) -> Result<Vec<(Key, Value)>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read();

        let start = match &options.start {
            Some(start) => Bound::Included(start.clone()),
            None => Bound::Unbounded,
        };
        let end = match &options.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(s), Bound::Excluded(e)) = (&start, &end) {
            if s >= e {
                return Ok(Vec::new());
            }
        }

        let limit = options.limit.unwrap_or(usize::MAX);
        let range = data.range((start, end));
        let entries = if options.reverse {
            range
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            range.take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        Ok(entries)
    }

    fn restore(&self, entries: Vec<(Key, Value)>) -> Result<()> {
        let mut data = self.data.write();
        *data = entries.into_iter().collect();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }
}

/// Hands out one [`MemoryStorage`] per subnode and keeps it around, so a
/// subnode that is recreated on the same node finds its old data.
#[derive(Debug, Default)]
pub struct MemoryStorageFactory {
    stores: DashMap<SubnodeId, Arc<MemoryStorage>>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The storage opened for `subnode`, if any.
    pub fn storage(&self, subnode: &SubnodeId) -> Option<Arc<MemoryStorage>> {
        self.stores.get(subnode).map(|s| s.value().clone())
    }
}

impl StorageFactory for MemoryStorageFactory {
    fn open(&self, subnode: &SubnodeId) -> Result<Arc<dyn Storage>> {
        let storage = self
            .stores
            .entry(subnode.clone())
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .value()
            .clone();
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> MemoryStorage {
        let storage = MemoryStorage::new();
        for k in ["a", "b", "c", "d"] {
            storage.put(k.as_bytes().to_vec(), k.to_uppercase().into_bytes()).unwrap();
        }
        storage
    }

    #[test]
    fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        storage.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));

        storage.delete(b"k").unwrap();
        assert_eq!(storage.get(b"k").unwrap(), None);
        assert_eq!(storage.stats().writes, 2);
    }

    #[test]
    fn test_batch() {
        let storage = filled();
        storage
            .batch(vec![BatchOp::delete(b"a".to_vec()), BatchOp::put(b"e".to_vec(), b"E".to_vec())])
            .unwrap();
        assert_eq!(storage.get(b"a").unwrap(), None);
        assert_eq!(storage.get(b"e").unwrap(), Some(b"E".to_vec()));
        assert_eq!(storage.len(), 4);
    }

    #[test]
    fn test_iterate_range() {
        let storage = filled();

        let entries = storage
            .iterate(&ReadOptions::default().with_start(b"b".to_vec()).with_end(b"d".to_vec()))
            .unwrap();
        let keys: Vec<_> = entries.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let entries = storage
            .iterate(&ReadOptions::default().reversed().with_limit(2))
            .unwrap();
        let keys: Vec<_> = entries.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec()]);

        let empty = storage
            .iterate(&ReadOptions::default().with_start(b"c".to_vec()).with_end(b"a".to_vec()))
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_restore_replaces_content() {
        let storage = filled();
        storage.restore(vec![(b"z".to_vec(), b"Z".to_vec())]).unwrap();
        assert_eq!(storage.snapshot().unwrap(), vec![(b"z".to_vec(), b"Z".to_vec())]);
    }

    #[test]
    fn test_factory_reuses_storage() {
        let factory = MemoryStorageFactory::new();
        let id = SubnodeId::new("a:1", "p");
        factory.open(&id).unwrap().put(b"k".to_vec(), b"v".to_vec()).unwrap();

        let reopened = factory.open(&id).unwrap();
        assert_eq!(reopened.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(factory.storage(&id).unwrap().len(), 1);
    }
}
