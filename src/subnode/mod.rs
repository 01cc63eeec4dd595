//! One node's participation in one partition's consensus group.
//!
//! A [`PartitionSubnode`] owns the consensus instance for its partition plus
//! the two components that keep the group in shape:
//!
//! - [`TopologyReconciler`]: while this subnode leads, makes the group match
//!   the partition's owner set (ensure remotes, join, evict dead peers).
//! - [`Quitter`]: once this node drops out of the owner set, removes the
//!   local subnode after the new owners are confirmed healthy.
//!
//! ```text
//!   consensus events ──► event loop ──► reconciler (PeerSet, passes)
//!                           │                 │
//!                           │                 └──► quitter ──► leave_self
//!                           └── Left(self) ──► node registry drops subnode
//! ```

mod quitter;
mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use quitter::{Quitter, QuitterState};
pub use topology::{ReconcilerStats, TopologyReconciler};

use crate::cluster::PartitionTopology;
use crate::config::SubnodeConfig;
use crate::consensus::{Consensus, ConsensusEvent, ConsensusFactory};
use crate::error::{Error, Result};
use crate::storage::StorageFactory;
use crate::types::{
    Command, CommandResult, ConsensusRole, PartitionInfo, PartitionName, SubnodeId,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often role waits re-check the consensus state between events.
const ROLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Group membership operations as seen by reconciliation and the quitter.
#[async_trait::async_trait]
pub trait MembershipController: Send + Sync + 'static {
    /// The local subnode.
    fn id(&self) -> &SubnodeId;

    /// Whether the local member currently leads its group.
    fn is_leader(&self) -> bool;

    /// Group members as known to consensus, the local subnode included.
    fn members(&self) -> Vec<SubnodeId>;

    async fn join(&self, peer: SubnodeId) -> Result<()>;

    async fn leave(&self, peer: SubnodeId) -> Result<()>;

    /// Remove the local subnode from its group.
    async fn leave_self(&self) -> Result<()> {
        self.leave(self.id().clone()).await
    }
}

/// [`MembershipController`] backed by a consensus instance.
pub struct ConsensusMembership {
    id: SubnodeId,
    consensus: Arc<dyn Consensus>,
}

impl ConsensusMembership {
    pub fn new(id: SubnodeId, consensus: Arc<dyn Consensus>) -> Self {
        Self { id, consensus }
    }
}

#[async_trait::async_trait]
impl MembershipController for ConsensusMembership {
    fn id(&self) -> &SubnodeId {
        &self.id
    }

    fn is_leader(&self) -> bool {
        self.consensus.role() == ConsensusRole::Leader
    }

    fn members(&self) -> Vec<SubnodeId> {
        self.consensus.peers()
    }

    async fn join(&self, peer: SubnodeId) -> Result<()> {
        debug!(subnode = %self.id, peer = %peer, "Joining peer");
        self.consensus.join(peer).await
    }

    async fn leave(&self, peer: SubnodeId) -> Result<()> {
        debug!(subnode = %self.id, peer = %peer, "Removing peer");
        self.consensus
            .leave(peer.clone())
            .await
            .map_err(|e| Error::LeaveFailed {
                subnode: peer,
                reason: e.to_string(),
            })
    }
}

/// Lifecycle of a subnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnodeState {
    Stopped,
    Starting,
    Started,
}

/// How [`PartitionSubnode::start`] completes.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Role to reach before start completes.
    pub wait_for: ConsensusRole,

    /// Weaken the member for this long right after it starts.
    pub weaken_duration: Option<Duration>,

    /// Run a forced reconciliation pass alongside the start.
    pub force_remotes: bool,

    /// Give up waiting for `wait_for` after this long and keep the role
    /// reached so far.
    pub max_wait: Option<Duration>,
}

impl StartOptions {
    /// Start as the designated leader of the group.
    pub fn leader() -> Self {
        Self {
            wait_for: ConsensusRole::Leader,
            weaken_duration: None,
            force_remotes: false,
            max_wait: None,
        }
    }

    /// Start as a secondary, weakened for `duration`.
    pub fn secondary(duration: Duration) -> Self {
        Self {
            wait_for: ConsensusRole::Weakened,
            weaken_duration: Some(duration),
            force_remotes: false,
            max_wait: None,
        }
    }

    pub fn with_force_remotes(mut self, force: bool) -> Self {
        self.force_remotes = force;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }
}

/// Sent to the owning node when a subnode left its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnodeDeparture {
    pub partition: PartitionName,
    /// Registry generation of the departed subnode.
    pub generation: u64,
}

/// Collaborators shared by every subnode of a node.
pub struct SubnodeContext {
    pub topology: Arc<dyn PartitionTopology>,
    pub consensus: Arc<dyn ConsensusFactory>,
    pub storage: Arc<dyn StorageFactory>,
    pub config: SubnodeConfig,
    pub departures: mpsc::UnboundedSender<SubnodeDeparture>,
}

struct Running {
    consensus: Arc<dyn Consensus>,
    reconciler: Arc<TopologyReconciler>,
}

/// The local participant in one partition's consensus group.
pub struct PartitionSubnode {
    id: SubnodeId,
    partition: PartitionName,
    generation: u64,
    /// Initial consensus peers.
    peers: Vec<SubnodeId>,
    context: Arc<SubnodeContext>,
    state: watch::Sender<SubnodeState>,
    role: watch::Sender<ConsensusRole>,
    running: RwLock<Option<Arc<Running>>>,
    /// Outcome of the last failed start, handed to concurrent starters.
    start_error: Mutex<Option<Error>>,
    cancel: CancellationToken,
}

impl PartitionSubnode {
    pub fn new(
        partition: impl Into<PartitionName>,
        peers: Vec<SubnodeId>,
        generation: u64,
        context: Arc<SubnodeContext>,
    ) -> Arc<Self> {
        let partition = partition.into();
        let id = SubnodeId::new(&context.topology.whoami(), &partition);
        let (state, _) = watch::channel(SubnodeState::Stopped);
        let (role, _) = watch::channel(ConsensusRole::Follower);

        Arc::new(Self {
            id,
            partition,
            generation,
            peers,
            context,
            state,
            role,
            running: RwLock::new(None),
            start_error: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &SubnodeId {
        &self.id
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SubnodeState {
        *self.state.borrow()
    }

    /// Last role reported by consensus.
    pub fn role(&self) -> ConsensusRole {
        *self.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.consensus()
            .map(|c| c.role() == ConsensusRole::Leader)
            .unwrap_or(false)
    }

    pub fn reconciler(&self) -> Option<Arc<TopologyReconciler>> {
        self.running.read().as_ref().map(|r| r.reconciler.clone())
    }

    /// Start the subnode.
    ///
    /// Idempotent: a started subnode returns at once, and concurrent callers
    /// wait for the start already in progress and share its outcome.
    pub async fn start(self: &Arc<Self>, options: StartOptions) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }

        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == SubnodeState::Stopped {
                *state = SubnodeState::Starting;
                claimed = true;
                true
            } else {
                false
            }
        });

        if !claimed {
            let mut states = self.state.subscribe();
            let state = states
                .wait_for(|s| *s != SubnodeState::Starting)
                .await
                .map(|s| *s)
                .map_err(|_| Error::Stopped)?;
            return match state {
                SubnodeState::Started => {
                    if options.force_remotes {
                        self.topology_updated(true);
                    }
                    Ok(())
                }
                _ => Err(self.start_error.lock().clone().unwrap_or(Error::Stopped)),
            };
        }

        info!(subnode = %self.id, wait_for = ?options.wait_for, "Starting subnode");
        match self.start_consensus(&options).await {
            Ok(()) => {
                self.state.send_replace(SubnodeState::Started);
                info!(subnode = %self.id, role = ?self.role(), "Subnode started");
                Ok(())
            }
            Err(e) => {
                warn!(subnode = %self.id, error = %e, "Subnode failed to start");
                *self.start_error.lock() = Some(e.clone());
                let running = self.running.write().take();
                if let Some(running) = running {
                    running.reconciler.stop();
                    if let Err(stop_err) = running.consensus.stop().await {
                        warn!(subnode = %self.id, error = %stop_err, "Failed to stop consensus");
                    }
                }
                self.state.send_replace(SubnodeState::Stopped);
                Err(e)
            }
        }
    }

    async fn start_consensus(self: &Arc<Self>, options: &StartOptions) -> Result<()> {
        let storage = self.context.storage.open(&self.id)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        debug!(subnode = %self.id, peers = ?self.peers, "Creating consensus");
        let consensus = self.context.consensus.create(
            self.id.clone(),
            self.peers.clone(),
            storage,
            events_tx,
        )?;

        let membership = Arc::new(ConsensusMembership::new(self.id.clone(), consensus.clone()));
        let reconciler = TopologyReconciler::new(
            self.id.clone(),
            self.context.topology.clone(),
            membership,
            &self.context.config,
            self.cancel.child_token(),
        );
        *self.running.write() = Some(Arc::new(Running {
            consensus: consensus.clone(),
            reconciler: reconciler.clone(),
        }));
        self.spawn_event_loop(events_rx);

        consensus.start().await?;
        if let Some(duration) = options.weaken_duration {
            consensus.weaken(duration);
        }
        if options.force_remotes {
            reconciler.topology_updated(true);
        }

        self.wait_for_role(&consensus, options.wait_for, options.max_wait)
            .await
    }

    async fn wait_for_role(
        &self,
        consensus: &Arc<dyn Consensus>,
        wanted: ConsensusRole,
        max_wait: Option<Duration>,
    ) -> Result<()> {
        let mut roles = self.role.subscribe();
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        loop {
            let role = consensus.role();
            if role_reached(wanted, role, consensus.leader().as_ref(), &self.id) {
                debug!(subnode = %self.id, ?role, "Reached start role");
                return Ok(());
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                warn!(
                    subnode = %self.id,
                    wanted = ?wanted,
                    ?role,
                    "Start role not reached, continuing"
                );
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Stopped),
                _ = roles.changed() => {}
                _ = tokio::time::sleep(ROLE_POLL_INTERVAL) => {}
            }
        }
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ConsensusEvent>) {
        let subnode: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match subnode.upgrade() {
                    Some(subnode) => subnode.on_consensus_event(event),
                    None => break,
                }
            }
            debug!(subnode = %id, "Consensus event loop stopped");
        });
    }

    fn on_consensus_event(self: &Arc<Self>, event: ConsensusEvent) {
        match event {
            ConsensusEvent::NewState(role) => {
                debug!(subnode = %self.id, ?role, "New consensus state");
                self.role.send_replace(role);
                match role {
                    ConsensusRole::Candidate => self.maybe_weaken(),
                    ConsensusRole::Leader => {
                        info!(subnode = %self.id, "Became partition leader");
                        self.topology_updated(false);
                    }
                    _ => {}
                }
            }
            ConsensusEvent::Joined(peer) => {
                if let Some(reconciler) = self.reconciler() {
                    reconciler.peer_joined(peer);
                }
            }
            ConsensusEvent::Left(peer) => {
                if let Some(reconciler) = self.reconciler() {
                    reconciler.peer_left(&peer);
                }
                if peer == self.id {
                    info!(subnode = %self.id, "Removed from partition group");
                    self.depart();
                }
            }
        }
    }

    /// A candidate that is not the ring's choice steps aside while the
    /// designated leader is reachable.
    fn maybe_weaken(self: &Arc<Self>) {
        let topology = &self.context.topology;
        let Some(leader) = topology.leader_of(&self.partition) else {
            return;
        };
        if leader == topology.whoami() {
            return;
        }

        let subnode = self.clone();
        tokio::spawn(async move {
            match subnode.context.topology.ping(&leader).await {
                Ok(()) => {
                    let Ok(consensus) = subnode.consensus() else {
                        return;
                    };
                    if consensus.role() == ConsensusRole::Candidate {
                        debug!(subnode = %subnode.id, leader = %leader, "Leader is up, weakening");
                        let config = &subnode.context.config;
                        consensus.weaken(config.weaken_when_candidate_and_leader_up);
                    }
                }
                Err(e) => {
                    warn!(
                        subnode = %subnode.id,
                        leader = %leader,
                        error = %e,
                        "Partition leader unreachable"
                    );
                }
            }
        });
    }

    fn depart(&self) {
        let departure = SubnodeDeparture {
            partition: self.partition.clone(),
            generation: self.generation,
        };
        if self.context.departures.send(departure).is_err() {
            debug!(subnode = %self.id, "Node gone, departure dropped");
        }
    }

    fn consensus(&self) -> Result<Arc<dyn Consensus>> {
        self.running
            .read()
            .as_ref()
            .map(|r| r.consensus.clone())
            .ok_or_else(|| Error::SubnodeNotStarted(self.id.clone()))
    }

    /// Execute a storage command through consensus.
    pub async fn command(&self, command: Command) -> Result<CommandResult> {
        if self.state() != SubnodeState::Started {
            return Err(Error::SubnodeNotStarted(self.id.clone()));
        }
        if command == Command::Info {
            return self.info().map(CommandResult::Info);
        }
        self.consensus()?.command(command).await
    }

    /// Describe the group as seen by this subnode.
    pub fn info(&self) -> Result<PartitionInfo> {
        let consensus = self.consensus()?;
        Ok(PartitionInfo {
            node_id: self.context.topology.whoami(),
            subnode_id: self.id.clone(),
            peers: consensus.peers(),
        })
    }

    pub async fn join(&self, peer: SubnodeId) -> Result<()> {
        if peer == self.id {
            return Ok(());
        }
        self.consensus()?.join(peer).await
    }

    pub async fn leave(&self, peer: SubnodeId) -> Result<()> {
        if peer == self.id {
            return Ok(());
        }
        self.consensus()?.leave(peer).await
    }

    /// Remove this subnode from its group and have the node drop it.
    pub async fn leave_self(&self) -> Result<()> {
        let consensus = self.consensus()?;
        consensus
            .leave(self.id.clone())
            .await
            .map_err(|e| Error::LeaveFailed {
                subnode: self.id.clone(),
                reason: e.to_string(),
            })?;
        self.depart();
        Ok(())
    }

    /// The ring changed. `force` runs a pass even when not leading.
    pub fn topology_updated(self: &Arc<Self>, force: bool) {
        match self.reconciler() {
            Some(reconciler) => reconciler.topology_updated(force),
            None => debug!(subnode = %self.id, "Topology update before start, ignored"),
        }
    }

    /// Cancel background work and stop the consensus member.
    pub async fn stop(&self) -> Result<()> {
        info!(subnode = %self.id, "Stopping subnode");
        self.cancel.cancel();
        let running = self.running.write().take();
        self.state.send_replace(SubnodeState::Stopped);
        match running {
            Some(running) => {
                running.reconciler.stop();
                running.consensus.stop().await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PartitionSubnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSubnode")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("role", &self.role())
            .finish()
    }
}

/// Whether `role` satisfies a start that waits for `wanted`.
///
/// A designated leader is also done once it follows another live leader,
/// and a secondary once it is part of a group with a leader.
fn role_reached(
    wanted: ConsensusRole,
    role: ConsensusRole,
    leader: Option<&SubnodeId>,
    me: &SubnodeId,
) -> bool {
    if role == wanted {
        return true;
    }
    match wanted {
        ConsensusRole::Leader => {
            matches!(role, ConsensusRole::Follower | ConsensusRole::Weakened)
                && leader.map(|l| l != me).unwrap_or(false)
        }
        ConsensusRole::Weakened => role == ConsensusRole::Leader || leader.is_some(),
        _ => false,
    }
}
