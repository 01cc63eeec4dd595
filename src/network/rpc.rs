//! RPC message types exchanged between nodes.

use crate::error::{Error, Result};
use crate::types::{Command, CommandResult, NodeId, PartitionInfo, PartitionName, SubnodeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Requests a node can send to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRequest {
    /// Liveness probe.
    Ping,

    /// Make sure the receiver hosts a started subnode for the partition.
    /// `peers` seeds the new consensus group when one has to be created.
    EnsurePartition {
        partition: PartitionName,
        peers: Vec<SubnodeId>,
    },

    /// Resolve the receiver's subnode id for a partition.
    PartitionAddress { partition: PartitionName },

    /// Describe the receiver's view of the partition group.
    PartitionInfo { partition: PartitionName },

    /// Opaque user request for the partition leader.
    UserRequest {
        partition: PartitionName,
        body: Bytes,
    },

    /// Storage command for the partition leader.
    Command {
        partition: PartitionName,
        command: Command,
    },
}

impl ClusterRequest {
    /// Short name used in logs and timeout errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterRequest::Ping => "ping",
            ClusterRequest::EnsurePartition { .. } => "ensure partition",
            ClusterRequest::PartitionAddress { .. } => "partition address",
            ClusterRequest::PartitionInfo { .. } => "partition info",
            ClusterRequest::UserRequest { .. } => "user request",
            ClusterRequest::Command { .. } => "command",
        }
    }
}

/// Replies to a [`ClusterRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterResponse {
    Pong { node_id: NodeId },
    Subnode(SubnodeId),
    Info(PartitionInfo),
    Reply(Bytes),
    Result(CommandResult),
    Error(WireError),
}

/// Errors as they travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    RingNotReady,
    NotLeader { leader: Option<SubnodeId> },
    NoRequestHandler,
    Other(String),
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        match err {
            Error::RingNotReady => WireError::RingNotReady,
            Error::NotLeader { leader } => WireError::NotLeader {
                leader: leader.clone(),
            },
            Error::NoRequestHandler => WireError::NoRequestHandler,
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::RingNotReady => Error::RingNotReady,
            WireError::NotLeader { leader } => Error::NotLeader { leader },
            WireError::NoRequestHandler => Error::NoRequestHandler,
            WireError::Other(msg) => Error::Internal(msg),
        }
    }
}

impl ClusterResponse {
    /// Convert a handler outcome into a response.
    pub fn from_result(result: Result<ClusterResponse>) -> Self {
        match result {
            Ok(response) => response,
            Err(e) => ClusterResponse::Error(WireError::from(&e)),
        }
    }

    /// Split a response back into a handler outcome.
    pub fn into_result(self) -> Result<ClusterResponse> {
        match self {
            ClusterResponse::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }

    pub fn into_subnode(self) -> Result<SubnodeId> {
        match self.into_result()? {
            ClusterResponse::Subnode(id) => Ok(id),
            other => Err(unexpected("subnode", &other)),
        }
    }

    pub fn into_info(self) -> Result<PartitionInfo> {
        match self.into_result()? {
            ClusterResponse::Info(info) => Ok(info),
            other => Err(unexpected("info", &other)),
        }
    }

    pub fn into_reply(self) -> Result<Bytes> {
        match self.into_result()? {
            ClusterResponse::Reply(body) => Ok(body),
            other => Err(unexpected("reply", &other)),
        }
    }

    pub fn into_command_result(self) -> Result<CommandResult> {
        match self.into_result()? {
            ClusterResponse::Result(result) => Ok(result),
            other => Err(unexpected("command result", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &ClusterResponse) -> Error {
    Error::Internal(format!("expected {} response, got {:?}", expected, got))
}

/// Encode a request for the wire.
pub fn encode_request(req: &ClusterRequest) -> Result<Vec<u8>> {
    Ok(bincode::serialize(req)?)
}

/// Decode a request from the wire.
pub fn decode_request(data: &[u8]) -> Result<ClusterRequest> {
    Ok(bincode::deserialize(data)?)
}

/// Encode a response for the wire.
pub fn encode_response(resp: &ClusterResponse) -> Result<Vec<u8>> {
    Ok(bincode::serialize(resp)?)
}

/// Decode a response from the wire.
pub fn decode_response(data: &[u8]) -> Result<ClusterResponse> {
    Ok(bincode::deserialize(data)?)
}
