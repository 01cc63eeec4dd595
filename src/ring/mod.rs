//! The consistent-hashing ring the cluster is built on.
//!
//! The ring owns node membership, failure detection and message delivery.
//! Everything above it only sees the [`Ring`] trait: partition placement
//! (`lookup`/`next`), point-to-point requests (`send`), key-routed requests
//! (`route`) and membership events.

mod events;
mod local;

pub use events::RingEvent;
pub use local::{LocalRing, LocalRingNetwork};

use crate::error::Result;
use crate::network::{ClusterRequest, ClusterResponse, MessageHandler};
use crate::types::NodeId;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A node's handle on the consistent-hashing ring.
#[async_trait::async_trait]
pub trait Ring: Send + Sync + 'static {
    /// This node's id.
    fn whoami(&self) -> NodeId;

    /// Whether this node has finished joining the ring.
    fn is_ready(&self) -> bool;

    /// Resolves once the ring is ready.
    async fn ready(&self);

    /// Owner of `key`.
    fn lookup(&self, key: &[u8]) -> Option<NodeId>;

    /// Next node clockwise from `key` that is not in `exclude`.
    fn next(&self, key: &[u8], exclude: &[NodeId]) -> Option<NodeId>;

    /// Every node currently in the ring, this one included.
    fn peers(&self) -> Vec<NodeId>;

    /// Send a request to a specific peer.
    async fn send(&self, peer: &str, request: ClusterRequest) -> Result<ClusterResponse>;

    /// Send a request to the owner of `key`.
    async fn route(&self, key: &[u8], request: ClusterRequest) -> Result<ClusterResponse>;

    /// Subscribe to membership events.
    fn events(&self) -> broadcast::Receiver<RingEvent>;

    /// Install the handler for inbound requests.
    fn set_handler(&self, handler: Arc<dyn MessageHandler>);

    /// Leave the ring.
    async fn close(&self);
}
