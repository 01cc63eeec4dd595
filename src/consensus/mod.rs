//! Per-partition consensus.
//!
//! Each partition subnode runs one [`Consensus`] instance. The instance is a
//! black box as far as membership reconciliation goes: it elects a leader,
//! replicates commands, and changes group membership on request. Role and
//! membership changes come back as [`ConsensusEvent`]s on the channel given
//! to [`ConsensusFactory::create`].

mod local;
pub mod state_machine;

pub use local::{LocalConsensus, LocalConsensusConfig, LocalConsensusNetwork};
pub use state_machine::PartitionStateMachine;

use crate::error::Result;
use crate::storage::Storage;
use crate::types::{Command, CommandResult, ConsensusRole, SubnodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Notifications from a consensus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// The local member changed role.
    NewState(ConsensusRole),

    /// A member was added to the group.
    Joined(SubnodeId),

    /// A member was removed from the group.
    Left(SubnodeId),
}

/// One member of a partition's consensus group.
#[async_trait::async_trait]
pub trait Consensus: Send + Sync + 'static {
    fn id(&self) -> &SubnodeId;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Replicate and apply a command. Non-leaders either forward to the
    /// leader or fail with `NotLeader`.
    async fn command(&self, command: Command) -> Result<CommandResult>;

    /// Add `peer` to the group.
    async fn join(&self, peer: SubnodeId) -> Result<()>;

    /// Remove `peer` from the group.
    async fn leave(&self, peer: SubnodeId) -> Result<()>;

    /// Refuse to become candidate for `duration`.
    fn weaken(&self, duration: Duration);

    fn role(&self) -> ConsensusRole;

    /// The leader this member currently follows, if any.
    fn leader(&self) -> Option<SubnodeId>;

    /// Group members as seen by this member, itself included.
    fn peers(&self) -> Vec<SubnodeId>;
}

/// Creates consensus instances for new subnodes.
pub trait ConsensusFactory: Send + Sync + 'static {
    fn create(
        &self,
        id: SubnodeId,
        peers: Vec<SubnodeId>,
        storage: Arc<dyn Storage>,
        events: mpsc::UnboundedSender<ConsensusEvent>,
    ) -> Result<Arc<dyn Consensus>>;
}
