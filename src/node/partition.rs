//! Client-side handles on partitions and user requests.

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::types::{
    BatchOp, Command, CommandResult, Key, PartitionInfo, PartitionName, ReadOptions, Value,
};
use bytes::Bytes;
use std::sync::Arc;

/// Routes storage commands to a partition's leader.
#[derive(Clone)]
pub struct Partition {
    name: PartitionName,
    cluster: Arc<Cluster>,
}

impl Partition {
    pub(crate) fn new(name: impl Into<PartitionName>, cluster: Arc<Cluster>) -> Self {
        Self {
            name: name.into(),
            cluster,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        match self.command(Command::get(key)).await? {
            CommandResult::Value(value) => Ok(value),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.command(Command::put(key, value)).await.map(|_| ())
    }

    pub async fn delete(&self, key: impl Into<Key>) -> Result<()> {
        self.command(Command::delete(key)).await.map(|_| ())
    }

    /// Apply all operations atomically.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.command(Command::Batch(ops)).await.map(|_| ())
    }

    /// Entries of the partition within `options`, read on the leader.
    pub async fn read_stream(&self, options: ReadOptions) -> Result<Vec<(Key, Value)>> {
        match self.command(Command::ReadStream(options)).await? {
            CommandResult::Entries(entries) => Ok(entries),
            other => Err(unexpected("read stream", other)),
        }
    }

    pub async fn info(&self) -> Result<PartitionInfo> {
        match self.command(Command::Info).await? {
            CommandResult::Info(info) => Ok(info),
            other => Err(unexpected("info", other)),
        }
    }

    async fn command(&self, command: Command) -> Result<CommandResult> {
        self.cluster.route_command(&self.name, command).await
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition").field("name", &self.name).finish()
    }
}

fn unexpected(operation: &str, result: CommandResult) -> Error {
    Error::Internal(format!("unexpected {} result: {:?}", operation, result))
}

/// A user request delivered on the partition's leader node.
#[derive(Debug, Clone)]
pub struct PartitionRequest {
    partition: Partition,
    body: Bytes,
}

impl PartitionRequest {
    pub(crate) fn new(partition: Partition, body: Bytes) -> Self {
        Self { partition, body }
    }

    /// The partition the request was sent to.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Handle on another partition of the same cluster.
    pub fn other_partition(&self, name: impl Into<PartitionName>) -> Partition {
        Partition::new(name, self.partition.cluster.clone())
    }
}

/// Application handler for user requests.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: PartitionRequest) -> Result<Bytes>;
}
