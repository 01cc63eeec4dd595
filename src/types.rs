//! Core types used throughout shardkeeper.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the ring, derived from the node's network address.
pub type NodeId = String;

/// Name of a replicated partition. Partitions exist implicitly on first use.
pub type PartitionName = String;

/// Storage key.
pub type Key = Vec<u8>;

/// Storage value.
pub type Value = Vec<u8>;

/// Identity of one node's replica of one partition.
///
/// Encoded as `<node>/p/<partition>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubnodeId(String);

impl SubnodeId {
    const SEPARATOR: &'static str = "/p/";

    /// Build the subnode id for `partition` hosted on `node`.
    pub fn new(node: &str, partition: &str) -> Self {
        Self(format!("{}{}{}", node, Self::SEPARATOR, partition))
    }

    /// The node part of the id.
    pub fn node(&self) -> &str {
        self.0
            .split_once(Self::SEPARATOR)
            .map(|(node, _)| node)
            .unwrap_or(&self.0)
    }

    /// The partition part of the id.
    pub fn partition(&self) -> &str {
        self.0
            .split_once(Self::SEPARATOR)
            .map(|(_, partition)| partition)
            .unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a member inside its consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusRole {
    Follower,
    Candidate,
    Leader,
    /// Refuses to stand for election until the weaken period expires.
    Weakened,
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Key, value: Value },
    Delete { key: Key },
}

impl BatchOp {
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Range options for reading a partition in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Inclusive lower bound.
    pub start: Option<Key>,
    /// Exclusive upper bound.
    pub end: Option<Key>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl ReadOptions {
    pub fn with_start(mut self, start: impl Into<Key>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn with_end(mut self, end: impl Into<Key>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Commands executed against a partition through its consensus group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get { key: Key },
    Put { key: Key, value: Value },
    Delete { key: Key },
    Batch(Vec<BatchOp>),
    ReadStream(ReadOptions),
    /// Describe the partition's consensus group.
    Info,
}

impl Command {
    /// Create a Get command.
    pub fn get(key: impl Into<Key>) -> Self {
        Self::Get { key: key.into() }
    }

    /// Create a Put command.
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a Delete command.
    pub fn delete(key: impl Into<Key>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Whether the command mutates storage.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::Delete { .. } | Command::Batch(_)
        )
    }

    /// Serialize command to bytes.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize command from bytes.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Outcome of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    Value(Option<Value>),
    Done,
    Entries(Vec<(Key, Value)>),
    Info(PartitionInfo),
}

impl CommandResult {
    pub fn into_value(self) -> Option<Value> {
        match self {
            CommandResult::Value(v) => v,
            _ => None,
        }
    }
}

/// Description of a partition's consensus group as seen by one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Node that answered.
    pub node_id: NodeId,
    /// Subnode that answered.
    pub subnode_id: SubnodeId,
    /// Every member of the group, including the answering one.
    pub peers: Vec<SubnodeId>,
}
