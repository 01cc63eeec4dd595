//! State machine applying partition commands to storage.

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{Command, CommandResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Applies committed commands to a subnode's storage and tracks progress.
pub struct PartitionStateMachine {
    storage: Arc<dyn Storage>,

    /// The last applied index.
    applied_index: AtomicU64,

    /// Number of commands applied.
    commands_applied: AtomicU64,
}

impl PartitionStateMachine {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            applied_index: AtomicU64::new(0),
            commands_applied: AtomicU64::new(0),
        }
    }

    /// Apply a committed write at `index`.
    ///
    /// Entries at or below the applied index are skipped.
    pub fn apply(&self, index: u64, command: &Command) -> Result<CommandResult> {
        if index <= self.applied_index() {
            debug!(index, "Skipping already applied entry");
            return Ok(CommandResult::Done);
        }

        match command {
            Command::Put { key, value } => {
                debug!(index, key_len = key.len(), value_len = value.len(), "Applying PUT");
                self.storage.put(key.clone(), value.clone())?;
            }
            Command::Delete { key } => {
                debug!(index, key_len = key.len(), "Applying DELETE");
                self.storage.delete(key)?;
            }
            Command::Batch(ops) => {
                debug!(index, ops = ops.len(), "Applying BATCH");
                self.storage.batch(ops.clone())?;
            }
            other => {
                return Err(Error::Consensus(format!("not a write: {:?}", other)));
            }
        }

        self.applied_index.store(index, Ordering::SeqCst);
        self.commands_applied.fetch_add(1, Ordering::Relaxed);
        Ok(CommandResult::Done)
    }

    /// Serve a read against the local storage.
    pub fn read(&self, command: &Command) -> Result<CommandResult> {
        match command {
            Command::Get { key } => Ok(CommandResult::Value(self.storage.get(key)?)),
            Command::ReadStream(options) => {
                Ok(CommandResult::Entries(self.storage.iterate(options)?))
            }
            other => Err(Error::Consensus(format!("not a read: {:?}", other))),
        }
    }

    /// Replace storage content with a leader's snapshot.
    pub fn install_snapshot(&self, index: u64, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.storage.restore(entries)?;
        self.applied_index.store(index, Ordering::SeqCst);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.storage.snapshot()
    }

    /// Get the last applied index.
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Get the number of commands applied.
    pub fn commands_applied(&self) -> u64 {
        self.commands_applied.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PartitionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStateMachine")
            .field("applied_index", &self.applied_index())
            .field("commands_applied", &self.commands_applied())
            .finish()
    }
}
