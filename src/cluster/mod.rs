//! Cluster view: partition ownership and peer-to-peer partition management.
//!
//! [`Cluster`] wraps the ring. It computes each partition's owner set, routes
//! requests to partition leaders, and asks peers to host (or locate) their
//! subnode for a partition. Inbound requests are dispatched to the handler
//! attached by the local node.
//!
//! ```text
//!   Node ──request/command──► Cluster ──route(partition)──► ring leader
//!                               │
//!   reconciler ──ensure──────► Cluster ──send(peer)──► peer's Node
//!   quitter ───ping──────────► Cluster ──send(peer)──► peer
//! ```

mod connections;

pub use connections::{ClusterConnections, ConnectionStats, RequestOptions};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::{ClusterRequest, ClusterResponse, MessageHandler};
use crate::ring::{Ring, RingEvent};
use crate::types::{Command, CommandResult, NodeId, PartitionInfo, SubnodeId};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// What subnodes need to know about the cluster.
///
/// Reconciliation and self-departure depend only on this, so they can be
/// driven by a scripted topology in tests.
#[async_trait::async_trait]
pub trait PartitionTopology: Send + Sync + 'static {
    /// This node's id.
    fn whoami(&self) -> NodeId;

    /// Owner set of `partition`, leader first.
    fn owners_of(&self, partition: &str, exclude_self: bool) -> Vec<NodeId>;

    /// Whether `node` is currently a ring member.
    fn is_live(&self, node: &str) -> bool;

    /// Make `peer` host a started subnode for `partition`.
    async fn ensure_remote_partition(
        &self,
        partition: &str,
        peer: &str,
        peer_hint: Vec<SubnodeId>,
    ) -> Result<SubnodeId>;

    /// Liveness probe.
    async fn ping(&self, peer: &str) -> Result<()>;

    /// Ring leader of `partition`.
    fn leader_of(&self, partition: &str) -> Option<NodeId> {
        self.owners_of(partition, false).into_iter().next()
    }
}

/// The local node's view of the cluster.
pub struct Cluster {
    config: ClusterConfig,
    ring: Arc<dyn Ring>,
    connections: ClusterConnections,
    /// Handler for requests addressed to this node.
    local: RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, ring: Arc<dyn Ring>) -> Self {
        let connections = ClusterConnections::new(ring.clone(), config.retry_on_warning);
        Self {
            config,
            ring,
            connections,
            local: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn whoami(&self) -> NodeId {
        self.ring.whoami()
    }

    pub fn is_live(&self, node: &str) -> bool {
        self.ring.peers().iter().any(|p| p == node)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.ring.peers()
    }

    pub fn events(&self) -> broadcast::Receiver<RingEvent> {
        self.ring.events()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connections.stats()
    }

    /// Install the handler for inbound requests, both remote and local.
    pub fn attach(&self, handler: Arc<dyn MessageHandler>) {
        *self.local.write() = Some(handler.clone());
        self.ring.set_handler(handler);
    }

    pub async fn close(&self) {
        self.ring.close().await;
        self.local.write().take();
    }

    /// Owner set of `partition`: the ring owner of the partition name
    /// followed by the next `redundancy` distinct nodes clockwise.
    pub fn owners_of(&self, partition: &str, exclude_self: bool) -> Vec<NodeId> {
        let key = partition.as_bytes();
        let count = self.config.owner_count();

        let mut owners: Vec<NodeId> = Vec::with_capacity(count);
        if let Some(leader) = self.ring.lookup(key) {
            owners.push(leader);
            while owners.len() < count {
                match self.ring.next(key, &owners) {
                    Some(node) => owners.push(node),
                    None => break,
                }
            }
        }

        if exclude_self {
            let me = self.whoami();
            owners.retain(|n| *n != me);
        }
        owners
    }

    pub fn leader_of(&self, partition: &str) -> Option<NodeId> {
        self.owners_of(partition, false).into_iter().next()
    }

    /// Make `peer` host a started subnode for `partition` and return its id.
    ///
    /// Retries while `peer` stays in the owner set. Running out of retries
    /// fails with `EnsurePartitionFailed` wrapping `RetriesExceeded`.
    pub async fn ensure_remote_partition(
        &self,
        partition: &str,
        peer: &str,
        peer_hint: Vec<SubnodeId>,
    ) -> Result<SubnodeId> {
        let request = ClusterRequest::EnsurePartition {
            partition: partition.to_string(),
            peers: peer_hint,
        };
        self.partition_request("ensure partition", partition, peer, request)
            .await
            .and_then(ClusterResponse::into_subnode)
            .map_err(|source| Error::EnsurePartitionFailed {
                partition: partition.to_string(),
                peer: peer.to_string(),
                source: Box::new(source),
            })
    }

    /// Ask `peer` for its subnode id for `partition`.
    pub async fn resolve_remote_partition_address(
        &self,
        partition: &str,
        peer: &str,
    ) -> Result<SubnodeId> {
        if peer == self.whoami() {
            return Ok(SubnodeId::new(peer, partition));
        }
        let request = ClusterRequest::PartitionAddress {
            partition: partition.to_string(),
        };
        self.partition_request("partition address", partition, peer, request)
            .await?
            .into_subnode()
    }

    async fn partition_request(
        &self,
        operation: &str,
        partition: &str,
        peer: &str,
        request: ClusterRequest,
    ) -> Result<ClusterResponse> {
        if peer == self.whoami() {
            return self.local_request(request).await;
        }

        let options = RequestOptions::new(
            self.config.remote_partition_address_timeout,
            self.config.max_retries,
        );
        let max_attempts = self.config.remote_partition_address_max_retries + 1;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = self
                .connections
                .request(peer, request.clone(), options)
                .await
                .and_then(ClusterResponse::into_result);

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !self.owners_of(partition, false).iter().any(|n| n == peer) {
                debug!(partition, peer, error = %err, "Peer left the owner set, giving up");
                return Err(err);
            }
            if attempts >= max_attempts {
                warn!(partition, peer, attempts, error = %err, "{} retries exhausted", operation);
                return Err(Error::retries_exceeded(operation, attempts));
            }

            warn!(partition, peer, attempts, error = %err, "{} failed, retrying", operation);
            tokio::time::sleep(self.config.remote_partition_address_retry).await;
        }
    }

    /// Liveness probe with its own timeout and a single attempt.
    pub async fn ping(&self, peer: &str) -> Result<()> {
        if peer == self.whoami() {
            return Ok(());
        }
        let options = RequestOptions::new(self.config.ping_timeout, 1);
        self.connections
            .request(peer, ClusterRequest::Ping, options)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Execute a command on the partition leader.
    pub async fn route_command(&self, partition: &str, command: Command) -> Result<CommandResult> {
        let request = ClusterRequest::Command {
            partition: partition.to_string(),
            command,
        };
        self.route_with_retry(partition, request)
            .await?
            .into_command_result()
    }

    /// Deliver an opaque user request to the partition leader.
    pub async fn route_user_request(&self, partition: &str, body: Bytes) -> Result<Bytes> {
        let request = ClusterRequest::UserRequest {
            partition: partition.to_string(),
            body,
        };
        self.route_with_retry(partition, request).await?.into_reply()
    }

    /// Ask the partition leader to describe its group.
    pub async fn partition_info(&self, partition: &str) -> Result<PartitionInfo> {
        let request = ClusterRequest::PartitionInfo {
            partition: partition.to_string(),
        };
        self.route_with_retry(partition, request).await?.into_info()
    }

    /// Route to the ring owner of `partition`, retrying while the target is
    /// not (yet) the leader or its ring is not ready.
    async fn route_with_retry(
        &self,
        partition: &str,
        request: ClusterRequest,
    ) -> Result<ClusterResponse> {
        let mut retries: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                self.config.request_timeout,
                self.ring.route(partition.as_bytes(), request.clone()),
            )
            .await;

            let result = match outcome {
                Err(_) => Err(Error::Timeout {
                    peer: self.leader_of(partition).unwrap_or_default(),
                    payload: request.kind().to_string(),
                }),
                Ok(result) => result.and_then(ClusterResponse::into_result),
            };

            match result {
                Err(err) if err.is_transient() => {
                    if retries >= self.config.max_retries {
                        warn!(partition, retries, error = %err, "Routing retries exhausted");
                        return Err(Error::retries_exceeded(request.kind(), retries + 1));
                    }
                    retries += 1;
                    debug!(partition, retries, error = %err, "Retrying routed request");
                    tokio::time::sleep(self.config.retry_wait).await;
                }
                other => return other,
            }
        }
    }

    /// Dispatch a request to this node's own handler.
    async fn local_request(&self, request: ClusterRequest) -> Result<ClusterResponse> {
        let handler = self.local.read().clone();
        match handler {
            Some(handler) => handler.handle(self.whoami(), request).await.into_result(),
            None => Err(Error::RingNotReady),
        }
    }
}

#[async_trait::async_trait]
impl PartitionTopology for Cluster {
    fn whoami(&self) -> NodeId {
        Cluster::whoami(self)
    }

    fn owners_of(&self, partition: &str, exclude_self: bool) -> Vec<NodeId> {
        Cluster::owners_of(self, partition, exclude_self)
    }

    fn is_live(&self, node: &str) -> bool {
        Cluster::is_live(self, node)
    }

    async fn ensure_remote_partition(
        &self,
        partition: &str,
        peer: &str,
        peer_hint: Vec<SubnodeId>,
    ) -> Result<SubnodeId> {
        Cluster::ensure_remote_partition(self, partition, peer, peer_hint).await
    }

    async fn ping(&self, peer: &str) -> Result<()> {
        Cluster::ping(self, peer).await
    }
}
