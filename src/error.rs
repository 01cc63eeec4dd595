//! Error types for partition membership management.

use crate::types::{NodeId, PartitionName, SubnodeId};
use thiserror::Error;

/// Result type alias for shardkeeper operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// Errors are `Clone` because a pending subnode creation is shared between
/// every caller waiting on it, and each of them receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The target node is not a member of the ring.
    #[error("peer not found: {0}")]
    PeerNotFound(NodeId),

    /// A request to a peer did not complete in time.
    #[error("request to {peer} timed out: {payload}")]
    Timeout { peer: NodeId, payload: String },

    /// Bounded retries were exhausted.
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExceeded { operation: String, attempts: u32 },

    /// The local consensus member is not the leader.
    #[error("not leader, leader is: {leader:?}")]
    NotLeader { leader: Option<SubnodeId> },

    /// The ring has not finished joining yet.
    #[error("ring not ready")]
    RingNotReady,

    /// A remote peer could not be made to host the partition.
    #[error("failed to ensure partition {partition} on {peer}: {source}")]
    EnsurePartitionFailed {
        partition: PartitionName,
        peer: NodeId,
        #[source]
        source: Box<Error>,
    },

    /// The subnode has not finished starting.
    #[error("subnode not started: {0}")]
    SubnodeNotStarted(SubnodeId),

    /// Removing a member from a consensus group failed.
    #[error("{subnode} could not leave: {reason}")]
    LeaveFailed { subnode: SubnodeId, reason: String },

    /// Consensus layer rejected the operation.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Wire encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A user request arrived but no handler is installed.
    #[error("no request listener")]
    NoRequestHandler,

    /// The component was stopped while the operation was pending.
    #[error("stopped")]
    Stopped,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The target turned the request down without running it, so it is
    /// safe to send again after a short wait. A timed-out request may have
    /// run and is not transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotLeader { .. } | Error::RingNotReady)
    }

    /// True when bounded retries ran out, looking through ensure wrappers.
    pub fn is_retries_exceeded(&self) -> bool {
        match self {
            Error::RetriesExceeded { .. } => true,
            Error::EnsurePartitionFailed { source, .. } => source.is_retries_exceeded(),
            _ => false,
        }
    }

    pub(crate) fn retries_exceeded(operation: impl Into<String>, attempts: u32) -> Self {
        Error::RetriesExceeded {
            operation: operation.into(),
            attempts,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
