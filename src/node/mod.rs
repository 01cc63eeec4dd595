//! A cluster node: the partition registry and the request surface.
//!
//! ```text
//!   Node::command ──► Cluster::route_command ──► leader's Dispatcher
//!                                                   │
//!                                   get_or_create_subnode(partition)
//!                                                   │
//!                                                   ▼
//!                                  PartitionSubnode::command ──► consensus
//! ```
//!
//! Subnodes are created lazily on the first request for their partition.
//! Creation is a shared future held in the registry, so concurrent callers
//! wait on one creation, and a failed creation clears its entry.

mod partition;

pub use partition::{Partition, PartitionRequest, RequestHandler};

use crate::cluster::Cluster;
use crate::config::NodeConfig;
use crate::consensus::ConsensusFactory;
use crate::error::{Error, Result};
use crate::network::{ClusterRequest, ClusterResponse, MessageHandler, WireError};
use crate::ring::{Ring, RingEvent};
use crate::storage::{MemoryStorageFactory, StorageFactory};
use crate::subnode::{PartitionSubnode, StartOptions, SubnodeContext, SubnodeDeparture};
use crate::types::{Command, CommandResult, NodeId, PartitionInfo, PartitionName, SubnodeId};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SubnodeFuture = Shared<BoxFuture<'static, Result<Arc<PartitionSubnode>>>>;

struct PartitionEntry {
    generation: u64,
    subnode: SubnodeFuture,
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    config: NodeConfig,
    ring: Option<Arc<dyn Ring>>,
    consensus: Option<Arc<dyn ConsensusFactory>>,
    storage: Option<Arc<dyn StorageFactory>>,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            ring: None,
            consensus: None,
            storage: None,
            handler: None,
        }
    }

    pub fn with_ring(mut self, ring: Arc<dyn Ring>) -> Self {
        self.ring = Some(ring);
        self
    }

    pub fn with_consensus(mut self, consensus: Arc<dyn ConsensusFactory>) -> Self {
        self.consensus = Some(consensus);
        self
    }

    /// Storage for subnodes. Defaults to in-memory storage.
    pub fn with_storage(mut self, storage: Arc<dyn StorageFactory>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Node> {
        let ring = self
            .ring
            .ok_or_else(|| Error::Internal("a ring is required".into()))?;
        let consensus = self
            .consensus
            .ok_or_else(|| Error::Internal("a consensus factory is required".into()))?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorageFactory::new()));

        let cluster = Arc::new(Cluster::new(self.config.cluster.clone(), ring));
        let (departures_tx, departures_rx) = mpsc::unbounded_channel();
        let context = Arc::new(SubnodeContext {
            topology: cluster.clone(),
            consensus,
            storage,
            config: self.config.subnode.clone(),
            departures: departures_tx,
        });

        Ok(Node {
            inner: Arc::new(NodeInner {
                config: self.config,
                cluster,
                context,
                partitions: DashMap::new(),
                generations: AtomicU64::new(1),
                handler: self.handler,
                departures: Mutex::new(Some(departures_rx)),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

/// A member of the cluster hosting partition subnodes.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    cluster: Arc<Cluster>,
    context: Arc<SubnodeContext>,
    partitions: DashMap<PartitionName, PartitionEntry>,
    generations: AtomicU64,
    handler: Option<Arc<dyn RequestHandler>>,
    /// Taken by `start`.
    departures: Mutex<Option<mpsc::UnboundedReceiver<SubnodeDeparture>>>,
    cancel: CancellationToken,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn whoami(&self) -> NodeId {
        self.inner.cluster.whoami()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.inner.cluster
    }

    /// Attach to the ring and start background tasks.
    pub async fn start(&self) -> Result<()> {
        let Some(departures) = self.inner.departures.lock().take() else {
            return Ok(());
        };
        let dispatcher = Arc::new(Dispatcher {
            node: Arc::downgrade(&self.inner),
        });
        self.inner.cluster.attach(dispatcher);

        let inner = self.inner.clone();
        let events = self.inner.cluster.events();
        tokio::spawn(async move { inner.watch_topology(events).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.handle_departures(departures).await });

        info!(node = %self.whoami(), "Node started");
        Ok(())
    }

    /// Stop every subnode, background tasks and leave the ring.
    pub async fn stop(&self) -> Result<()> {
        info!(node = %self.whoami(), "Stopping node");
        self.inner.cancel.cancel();

        let names: Vec<PartitionName> = self
            .inner
            .partitions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        let leaves = names.iter().map(|name| self.inner.leave_partition(name));
        futures::future::join_all(leaves).await;

        self.inner.cluster.close().await;
        Ok(())
    }

    /// Send an opaque request to the partition's leader node.
    pub async fn request(&self, partition: &str, body: impl Into<Bytes>) -> Result<Bytes> {
        self.inner
            .cluster
            .route_user_request(partition, body.into())
            .await
    }

    /// Execute a storage command on the partition's leader.
    pub async fn command(&self, partition: &str, command: Command) -> Result<CommandResult> {
        self.inner.cluster.route_command(partition, command).await
    }

    /// Group description from the partition's leader node.
    pub async fn partition_info(&self, partition: &str) -> Result<PartitionInfo> {
        self.inner.cluster.partition_info(partition).await
    }

    pub fn partition(&self, name: impl Into<PartitionName>) -> Partition {
        Partition::new(name, self.inner.cluster.clone())
    }

    /// Partitions with a local subnode, created or being created.
    pub fn active_partitions(&self) -> Vec<PartitionName> {
        let mut names: Vec<PartitionName> = self
            .inner
            .partitions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// The local subnode of `partition`, once created.
    pub fn local_subnode(&self, partition: &str) -> Option<Arc<PartitionSubnode>> {
        let future = self.inner.partitions.get(partition)?.subnode.clone();
        match future.peek() {
            Some(Ok(subnode)) => Some(subnode.clone()),
            _ => None,
        }
    }

    /// The local subnode of `partition`, created and started if needed.
    pub async fn get_or_create_subnode(
        &self,
        partition: &str,
        force_remotes: bool,
        peer_hint: Option<Vec<SubnodeId>>,
    ) -> Result<Arc<PartitionSubnode>> {
        self.inner
            .get_or_create_subnode(partition, force_remotes, peer_hint)
            .await
    }

    /// Drop and stop the local subnode of `partition`.
    pub async fn leave_partition(&self, partition: &str) {
        self.inner.leave_partition(partition).await
    }
}

impl NodeInner {
    fn whoami(&self) -> NodeId {
        self.cluster.whoami()
    }

    async fn get_or_create_subnode(
        self: &Arc<Self>,
        partition: &str,
        force_remotes: bool,
        peer_hint: Option<Vec<SubnodeId>>,
    ) -> Result<Arc<PartitionSubnode>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }

        let future = match self.partitions.entry(partition.to_string()) {
            Entry::Occupied(entry) => entry.get().subnode.clone(),
            Entry::Vacant(entry) => {
                let generation = self.generations.fetch_add(1, Ordering::SeqCst);
                debug!(node = %self.whoami(), partition, generation, "Creating subnode");

                let node = self.clone();
                let name = partition.to_string();
                let creation = tokio::spawn(async move {
                    let result = node
                        .create_subnode(&name, generation, force_remotes, peer_hint)
                        .await;
                    if let Err(e) = &result {
                        warn!(
                            node = %node.whoami(),
                            partition = %name,
                            error = %e,
                            "Failed to create subnode"
                        );
                        node.partitions
                            .remove_if(&name, |_, entry| entry.generation == generation);
                    }
                    result
                });

                let future: SubnodeFuture = async move {
                    creation
                        .await
                        .map_err(|e| Error::Internal(format!("subnode creation aborted: {}", e)))?
                }
                .boxed()
                .shared();
                entry.insert(PartitionEntry {
                    generation,
                    subnode: future.clone(),
                });
                future
            }
        };
        future.await
    }

    async fn create_subnode(
        &self,
        partition: &str,
        generation: u64,
        force_remotes: bool,
        peer_hint: Option<Vec<SubnodeId>>,
    ) -> Result<Arc<PartitionSubnode>> {
        let peers = match peer_hint {
            Some(hint) if !hint.is_empty() => hint,
            _ => self.partition_subnode_addresses(partition).await?,
        };
        let subnode =
            PartitionSubnode::new(partition, peers.clone(), generation, self.context.clone());

        let options = if peers.first() == Some(subnode.id()) {
            debug!(subnode = %subnode.id(), "Designated partition leader");
            StartOptions::leader().with_max_wait(self.config.leader_election_wait)
        } else {
            StartOptions::secondary(self.config.secondary_weaken_at_startup)
        };
        subnode
            .start(options.with_force_remotes(force_remotes))
            .await?;
        Ok(subnode)
    }

    /// Subnode ids of the partition's owners, leader first.
    async fn partition_subnode_addresses(&self, partition: &str) -> Result<Vec<SubnodeId>> {
        let owners = self.cluster.owners_of(partition, false);
        let lookups = owners
            .iter()
            .map(|node| self.cluster.resolve_remote_partition_address(partition, node));
        futures::future::try_join_all(lookups).await
    }

    async fn leave_partition(&self, partition: &str) {
        let Some((_, entry)) = self.partitions.remove(partition) else {
            return;
        };
        let pending = entry.subnode.clone();
        let timeout = self.config.cluster.request_timeout;
        match tokio::time::timeout(timeout, entry.subnode).await {
            Ok(Ok(subnode)) => {
                stop_subnode(&subnode).await;
                info!(subnode = %subnode.id(), "Left partition");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    node = %self.whoami(),
                    partition,
                    "Subnode still starting, stopping it once started"
                );
                tokio::spawn(async move {
                    if let Ok(subnode) = pending.await {
                        stop_subnode(&subnode).await;
                        info!(subnode = %subnode.id(), "Stopped subnode of a left partition");
                    }
                });
            }
        }
    }

    async fn handle_departures(
        self: Arc<Self>,
        mut departures: mpsc::UnboundedReceiver<SubnodeDeparture>,
    ) {
        loop {
            let departure = tokio::select! {
                _ = self.cancel.cancelled() => return,
                departure = departures.recv() => match departure {
                    Some(departure) => departure,
                    None => return,
                },
            };
            let current = self
                .partitions
                .get(&departure.partition)
                .map(|e| e.generation == departure.generation)
                .unwrap_or(false);
            if current {
                self.leave_partition(&departure.partition).await;
            } else {
                debug!(partition = %departure.partition, "Stale departure ignored");
            }
        }
    }

    /// Collapse ring events within `topology_debounce` into one update of
    /// every local subnode.
    async fn watch_topology(self: Arc<Self>, mut events: broadcast::Receiver<RingEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => event.log(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Ring events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.topology_debounce) => break,
                    event = events.recv() => match event {
                        Ok(event) => event.log(),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            self.topology_changed();
        }
    }

    fn topology_changed(&self) {
        debug!(node = %self.whoami(), "Topology changed");
        let subnodes: Vec<SubnodeFuture> = self
            .partitions
            .iter()
            .map(|e| e.subnode.clone())
            .collect();
        for subnode in subnodes {
            tokio::spawn(async move {
                if let Ok(subnode) = subnode.await {
                    subnode.topology_updated(false);
                }
            });
        }
    }

    async fn handle_request(self: &Arc<Self>, request: ClusterRequest) -> Result<ClusterResponse> {
        match request {
            ClusterRequest::Ping => Ok(ClusterResponse::Pong {
                node_id: self.whoami(),
            }),
            ClusterRequest::EnsurePartition { partition, peers } => {
                let subnode = self
                    .get_or_create_subnode(&partition, false, Some(peers))
                    .await?;
                Ok(ClusterResponse::Subnode(subnode.id().clone()))
            }
            ClusterRequest::PartitionAddress { partition } => Ok(ClusterResponse::Subnode(
                SubnodeId::new(&self.whoami(), &partition),
            )),
            ClusterRequest::PartitionInfo { partition } => {
                let subnode = self.get_or_create_subnode(&partition, false, None).await?;
                Ok(ClusterResponse::Info(subnode.info()?))
            }
            ClusterRequest::UserRequest { partition, body } => {
                self.get_or_create_subnode(&partition, true, None).await?;
                let handler = self.handler.clone().ok_or(Error::NoRequestHandler)?;
                let request =
                    PartitionRequest::new(Partition::new(partition, self.cluster.clone()), body);
                Ok(ClusterResponse::Reply(handler.handle(request).await?))
            }
            ClusterRequest::Command { partition, command } => {
                let subnode = self.get_or_create_subnode(&partition, true, None).await?;
                Ok(ClusterResponse::Result(subnode.command(command).await?))
            }
        }
    }
}

async fn stop_subnode(subnode: &PartitionSubnode) {
    if let Err(e) = subnode.stop().await {
        warn!(subnode = %subnode.id(), error = %e, "Failed to stop subnode");
    }
}

/// Inbound request handler installed on the ring.
struct Dispatcher {
    node: Weak<NodeInner>,
}

#[async_trait::async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, from: NodeId, request: ClusterRequest) -> ClusterResponse {
        let Some(node) = self.node.upgrade() else {
            return ClusterResponse::Error(WireError::RingNotReady);
        };
        debug!(node = %node.whoami(), from = %from, request = request.kind(), "Inbound request");
        ClusterResponse::from_result(node.handle_request(request).await)
    }
}
