//! Key-value storage beneath each partition's consensus group.
//!
//! The consensus layer applies committed commands to a [`Storage`]; every
//! subnode gets its own instance from a [`StorageFactory`].

mod memory;

pub use memory::{MemoryStorage, MemoryStorageFactory, StorageStats};

use crate::error::Result;
use crate::types::{BatchOp, Key, ReadOptions, SubnodeId, Value};
use std::sync::Arc;

/// An ordered key-value engine.
pub trait Storage: Send + Sync + std::fmt::Debug + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    fn put(&self, key: Key, value: Value) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply all operations atomically.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Entries in key order within the given range.
    fn iterate(&self, options: &ReadOptions) -> Result<Vec<(Key, Value)>>;

    /// Replace the whole content, used when a new member catches up.
    fn restore(&self, entries: Vec<(Key, Value)>) -> Result<()>;

    fn clear(&self) -> Result<()>;

    /// Every entry, in key order.
    fn snapshot(&self) -> Result<Vec<(Key, Value)>> {
        self.iterate(&ReadOptions::default())
    }
}

/// Opens the storage for a subnode.
pub trait StorageFactory: Send + Sync + 'static {
    fn open(&self, subnode: &SubnodeId) -> Result<Arc<dyn Storage>>;
}
