//! In-process clusters for integration tests.
//!
//! A [`TestCluster`] runs every node in the current runtime. The nodes share
//! one [`LocalRingNetwork`], one [`LocalConsensusNetwork`] and one
//! [`MemoryStorageFactory`], so tests can look inside any replica.
//!
//! # Example
//!
//! ```rust,ignore
//! use shardkeeper::testing::TestCluster;
//!
//! let cluster = TestCluster::start(5).await?;
//! let users = cluster.nodes()[0].partition("users");
//! users.put(b"alice".to_vec(), b"1".to_vec()).await?;
//! cluster.stop().await?;
//! ```

#[cfg(test)]
mod partition_integration_tests;

use crate::config::NodeConfig;
use crate::consensus::LocalConsensusNetwork;
use crate::error::{Error, Result};
use crate::node::{Node, RequestHandler};
use crate::ring::LocalRingNetwork;
use crate::storage::{MemoryStorage, MemoryStorageFactory};
use crate::types::{ConsensusRole, NodeId, SubnodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BASE_PORT: u16 = 9000;

/// A set of nodes sharing in-process ring, consensus and storage.
pub struct TestCluster {
    ring: LocalRingNetwork,
    consensus: LocalConsensusNetwork,
    storage: Arc<MemoryStorageFactory>,
    handler: Option<Arc<dyn RequestHandler>>,
    nodes: Vec<Node>,
    next_port: u16,
}

impl TestCluster {
    /// Start `size` nodes with testing timers.
    pub async fn start(size: usize) -> Result<Self> {
        Self::start_with_handler(size, None).await
    }

    /// Start `size` nodes that all serve user requests with `handler`.
    pub async fn start_with_handler(
        size: usize,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Self> {
        let mut cluster = Self {
            ring: LocalRingNetwork::new(),
            consensus: LocalConsensusNetwork::default(),
            storage: Arc::new(MemoryStorageFactory::new()),
            handler,
            nodes: Vec::with_capacity(size),
            next_port: BASE_PORT,
        };
        for _ in 0..size {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Address the next added node will get.
    pub fn next_address(&self) -> NodeId {
        format!("127.0.0.1:{}", self.next_port)
    }

    /// Start one more node and join it to the ring.
    pub async fn add_node(&mut self) -> Result<Node> {
        let address = self.next_address();
        self.next_port += 1;

        let mut builder = Node::builder(NodeConfig::for_testing(address.clone()))
            .with_ring(self.ring.join(address))
            .with_consensus(Arc::new(self.consensus.clone()))
            .with_storage(self.storage.clone());
        if let Some(handler) = &self.handler {
            builder = builder.with_request_handler(handler.clone());
        }
        let node = builder.build()?;
        node.start().await?;
        self.nodes.push(node.clone());
        Ok(node)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.whoami() == address)
    }

    /// Stop a node and drop it from the ring, as a crash would.
    pub async fn kill(&mut self, address: &str) -> Result<()> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.whoami() == address)
            .ok_or_else(|| Error::PeerNotFound(address.to_string()))?;
        let node = self.nodes.remove(index);
        node.stop().await?;
        self.ring.remove(address);
        Ok(())
    }

    /// Current owner set of `partition`, leader first.
    pub fn owners(&self, partition: &str) -> Vec<NodeId> {
        let count = self
            .nodes
            .first()
            .map(|n| n.config().cluster.owner_count())
            .unwrap_or(1);
        self.ring.owners(partition.as_bytes(), count)
    }

    /// A running node outside the owner set of `partition`.
    pub fn non_owner(&self, partition: &str) -> Option<&Node> {
        let owners = self.owners(partition);
        self.nodes.iter().find(|n| !owners.contains(&n.whoami()))
    }

    /// Consensus leaders among the local subnodes of `partition`.
    pub fn leaders(&self, partition: &str) -> Vec<SubnodeId> {
        self.nodes
            .iter()
            .filter_map(|n| n.local_subnode(partition))
            .filter(|s| self.consensus.role_of(s.id()) == Some(ConsensusRole::Leader))
            .map(|s| s.id().clone())
            .collect()
    }

    /// Group view of a subnode, sorted.
    pub fn view_of(&self, subnode: &SubnodeId) -> Vec<SubnodeId> {
        let mut view = self.consensus.view_of(subnode);
        view.sort();
        view
    }

    /// Subnode ids of the current owners of `partition`, sorted.
    pub fn owner_subnodes(&self, partition: &str) -> Vec<SubnodeId> {
        let mut ids: Vec<SubnodeId> = self
            .owners(partition)
            .iter()
            .map(|n| SubnodeId::new(n, partition))
            .collect();
        ids.sort();
        ids
    }

    /// Whether `partition` has settled on its owner set: one leader, every
    /// owner hosting a subnode whose group view is exactly the owners, and
    /// the leader's PeerSet holding every other owner.
    pub fn converged(&self, partition: &str) -> bool {
        let leaders = self.leaders(partition);
        let [leader] = leaders.as_slice() else {
            return false;
        };
        let owners = self.owner_subnodes(partition);
        if !owners.contains(leader) {
            return false;
        }
        let views_match = owners.iter().all(|id| {
            self.node(id.node())
                .and_then(|n| n.local_subnode(partition))
                .is_some()
                && self.view_of(id) == owners
        });
        if !views_match {
            return false;
        }

        let expected: BTreeSet<SubnodeId> =
            owners.iter().filter(|id| *id != leader).cloned().collect();
        self.node(leader.node())
            .and_then(|n| n.local_subnode(partition))
            .and_then(|s| s.reconciler())
            .map(|r| r.peers() == expected)
            .unwrap_or(false)
    }

    /// Storage a subnode has written to, if it was ever opened.
    pub fn storage(&self, subnode: &SubnodeId) -> Option<Arc<MemoryStorage>> {
        self.storage.storage(subnode)
    }

    pub async fn stop(self) -> Result<()> {
        let stops = self.nodes.iter().map(|n| n.stop());
        futures::future::try_join_all(stops).await?;
        Ok(())
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Run `action` until its result satisfies `predicate` or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(
    timeout: Duration,
    mut action: F,
    predicate: P,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
