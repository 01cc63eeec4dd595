//! Partition membership for a replicated key-value store on a
//! consistent-hashing ring.
//!
//! Every partition is replicated on the nodes that own it on the ring: the
//! node its name hashes to (the partition leader) and the next `redundancy`
//! distinct nodes clockwise. Each owner runs one **subnode** for the
//! partition, a member of that partition's consensus group.
//!
//! As nodes come and go, the owner set moves. The leader of each group
//! reconciles membership: it asks new owners to host a subnode and joins
//! them, and removes members that died. A subnode that is no longer an owner
//! notices on its own and leaves once the new owners are healthy.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardkeeper::consensus::LocalConsensusNetwork;
//! use shardkeeper::ring::LocalRingNetwork;
//! use shardkeeper::{Node, NodeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shardkeeper::Result<()> {
//!     let ring = LocalRingNetwork::new();
//!     let consensus = LocalConsensusNetwork::default();
//!
//!     let node = Node::builder(NodeConfig::new("127.0.0.1:9000"))
//!         .with_ring(ring.join("127.0.0.1:9000"))
//!         .with_consensus(Arc::new(consensus))
//!         .build()?;
//!     node.start().await?;
//!
//!     // Writes go through the partition leader's consensus group.
//!     let users = node.partition("users");
//!     users.put(b"user:123".to_vec(), b"Alice".to_vec()).await?;
//!     assert_eq!(users.get(b"user:123".to_vec()).await?, Some(b"Alice".to_vec()));
//!
//!     node.stop().await
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                    Node                     │
//! │  partition registry · request dispatch      │
//! └─────────────────────────────────────────────┘
//!          │                         │
//!          ▼                         ▼
//! ┌─────────────────┐     ┌─────────────────────┐
//! │     Cluster     │     │  PartitionSubnode   │
//! │ owners · routing│◄────│ reconciler · quitter│
//! └─────────────────┘     └─────────────────────┘
//!          │                         │
//!          ▼                         ▼
//! ┌─────────────────┐     ┌─────────────────────┐
//! │      Ring       │     │ Consensus · Storage │
//! └─────────────────┘     └─────────────────────┘
//! ```

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod ring;
pub mod storage;
pub mod subnode;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{ClusterConfig, NodeConfig, QuitterConfig, SubnodeConfig};
pub use error::{Error, Result};
pub use node::{Node, NodeBuilder, Partition, PartitionRequest, RequestHandler};
pub use types::{
    BatchOp, Command, CommandResult, ConsensusRole, Key, NodeId, PartitionInfo, PartitionName,
    ReadOptions, SubnodeId, Value,
};

pub use cluster::{Cluster, PartitionTopology};
pub use consensus::{Consensus, ConsensusEvent, ConsensusFactory};
pub use partitioning::HashRing;
pub use ring::{Ring, RingEvent};
pub use storage::{Storage, StorageFactory};
pub use subnode::{MembershipController, PartitionSubnode, SubnodeState};

pub use testing::TestCluster;
