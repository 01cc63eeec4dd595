//! Inbound request handling.

use crate::network::rpc::{ClusterRequest, ClusterResponse};
use crate::types::NodeId;

/// Handler for requests arriving from peers.
///
/// The ring delivers every inbound [`ClusterRequest`] to the handler
/// registered for the receiving node, together with the sender's id.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming request and produce the reply.
    async fn handle(&self, from: NodeId, request: ClusterRequest) -> ClusterResponse;
}
