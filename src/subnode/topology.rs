//! Keeps a partition group's membership converged with its owner set.
//!
//! A pass computes the owner set without the local node, makes every owner
//! host a subnode, then joins the missing ones and removes peers whose node
//! left the ring. Passes never overlap: triggers arriving mid-pass collapse
//! into one rerun, and a failed pass is retried after a backoff.

use crate::cluster::PartitionTopology;
use crate::config::SubnodeConfig;
use crate::error::Result;
use crate::subnode::{MembershipController, Quitter};
use crate::types::SubnodeId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct PassState {
    running: bool,
    needs_another: bool,
    /// A forced pass is pending; survives failed attempts.
    force: bool,
}

/// A change to the reconciler's view of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerChange {
    Joined(SubnodeId),
    Left(SubnodeId),
}

/// Counters for reconciliation passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Topology notifications received while running.
    pub topology_updates: u64,
    pub passes: u64,
    pub failed_passes: u64,
    pub joins: u64,
    pub leaves: u64,
    /// Highest number of passes ever running at once.
    pub max_concurrent_passes: usize,
}

pub struct TopologyReconciler {
    id: SubnodeId,
    topology: Arc<dyn PartitionTopology>,
    membership: Arc<dyn MembershipController>,
    quitter: Arc<Quitter>,
    retry_backoff: Duration,

    pass_state: Mutex<PassState>,
    /// Group members joined through this subnode, itself excluded.
    peers: Mutex<BTreeSet<SubnodeId>>,
    in_flight: Mutex<HashSet<SubnodeId>>,

    passes: AtomicU64,
    failed_passes: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
    active_passes: AtomicUsize,
    max_concurrent_passes: AtomicUsize,

    topology_updates: AtomicU64,

    cancel: CancellationToken,
}

/// Marks a peer as having a join or leave in progress.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<SubnodeId>>,
    peer: SubnodeId,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<SubnodeId>>, peer: &SubnodeId) -> Option<Self> {
        if set.lock().insert(peer.clone()) {
            Some(Self {
                set,
                peer: peer.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.peer);
    }
}

impl TopologyReconciler {
    pub fn new(
        id: SubnodeId,
        topology: Arc<dyn PartitionTopology>,
        membership: Arc<dyn MembershipController>,
        config: &SubnodeConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let quitter = Arc::new(Quitter::new(
            id.partition().to_string(),
            id.clone(),
            topology.clone(),
            membership.clone(),
            config.quitter.clone(),
            cancel.child_token(),
        ));

        Arc::new(Self {
            id,
            topology,
            membership,
            quitter,
            retry_backoff: config.topology_retry,
            pass_state: Mutex::new(PassState::default()),
            peers: Mutex::new(BTreeSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            passes: AtomicU64::new(0),
            failed_passes: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            leaves: AtomicU64::new(0),
            active_passes: AtomicUsize::new(0),
            max_concurrent_passes: AtomicUsize::new(0),
            topology_updates: AtomicU64::new(0),
            cancel,
        })
    }

    pub fn quitter(&self) -> &Arc<Quitter> {
        &self.quitter
    }

    /// Current PeerSet.
    pub fn peers(&self) -> BTreeSet<SubnodeId> {
        self.peers.lock().clone()
    }

    /// Whether a pass is running or scheduled.
    pub fn is_updating(&self) -> bool {
        self.pass_state.lock().running
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            topology_updates: self.topology_updates.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            leaves: self.leaves.load(Ordering::Relaxed),
            max_concurrent_passes: self.max_concurrent_passes.load(Ordering::Relaxed),
        }
    }

    /// The ring or the group changed.
    ///
    /// Runs a pass when leading, or always when `force` is set, and starts
    /// the quitter if the local node is no longer an owner.
    pub fn topology_updated(self: &Arc<Self>, force: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.topology_updates.fetch_add(1, Ordering::Relaxed);
        debug!(subnode = %self.id, force, "Topology updated");
        if force || self.membership.is_leader() {
            self.trigger(force);
        }
        self.maybe_leave_self();
    }

    /// Schedule a pass, or fold into the one already running.
    pub fn trigger(self: &Arc<Self>, force: bool) {
        let mut state = self.pass_state.lock();
        state.force |= force;
        if state.running {
            debug!(subnode = %self.id, "Topology update in progress, another one queued");
            state.needs_another = true;
            return;
        }
        state.running = true;
        drop(state);

        let reconciler = self.clone();
        tokio::spawn(async move { reconciler.drive().await });
    }

    /// Start the quitter when the local node is outside the owner set.
    pub fn maybe_leave_self(&self) {
        let me = self.topology.whoami();
        let owners = self.topology.owners_of(self.id.partition(), false);
        if !owners.contains(&me) {
            debug!(subnode = %self.id, ?owners, "Not part of the owner set");
            self.quitter.start();
        }
    }

    pub fn peer_joined(&self, peer: SubnodeId) {
        self.apply_peer_change(PeerChange::Joined(peer));
    }

    pub fn peer_left(&self, peer: &SubnodeId) {
        self.apply_peer_change(PeerChange::Left(peer.clone()));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The only place PeerSet changes.
    fn apply_peer_change(&self, change: PeerChange) {
        let mut peers = self.peers.lock();
        match change {
            PeerChange::Joined(peer) if peer != self.id => {
                if peers.insert(peer.clone()) {
                    debug!(subnode = %self.id, peer = %peer, "Peer joined");
                }
            }
            PeerChange::Left(peer) => {
                if peers.remove(&peer) {
                    debug!(subnode = %self.id, peer = %peer, "Peer left");
                }
            }
            PeerChange::Joined(_) => {}
        }
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let force = {
                let mut state = self.pass_state.lock();
                state.needs_another = false;
                std::mem::take(&mut state.force)
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let ran = force || self.membership.is_leader();
            if ran {
                if let Err(e) = self.run_pass().await {
                    self.failed_passes.fetch_add(1, Ordering::Relaxed);
                    warn!(subnode = %self.id, error = %e, "Topology update failed, retrying");
                    self.pass_state.lock().force |= force;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                    continue;
                }
            } else {
                debug!(subnode = %self.id, "No longer leader, skipping topology update");
            }

            {
                let mut state = self.pass_state.lock();
                if state.needs_another {
                    continue;
                }
                state.running = false;
            }
            if ran {
                self.quitter.topology_stabilized();
            }
            return;
        }
        self.pass_state.lock().running = false;
    }

    async fn run_pass(&self) -> Result<()> {
        let active = self.active_passes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_passes.fetch_max(active, Ordering::SeqCst);
        let result = self.pass().await;
        self.active_passes.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.passes.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn pass(&self) -> Result<()> {
        let partition = self.id.partition();
        let nodes = self.topology.owners_of(partition, true);
        let hint = self.peer_hint();
        debug!(subnode = %self.id, ?nodes, "Ensuring partition on owners");

        let ensures = nodes.iter().map(|node| {
            self.topology.ensure_remote_partition(partition, node, hint.clone())
        });
        let desired: BTreeSet<SubnodeId> = futures::future::try_join_all(ensures)
            .await?
            .into_iter()
            .filter(|peer| *peer != self.id)
            .collect();

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let current = self.peers();
        let joins: Vec<SubnodeId> = desired.difference(&current).cloned().collect();

        // Members the group had before this subnode joined anyone are
        // candidates for removal too.
        let mut known = current;
        known.extend(
            self.membership
                .members()
                .into_iter()
                .filter(|peer| *peer != self.id),
        );
        let leaves: Vec<SubnodeId> = known
            .difference(&desired)
            .filter(|peer| !self.topology.is_live(peer.node()))
            .cloned()
            .collect();

        for peer in joins {
            self.join(peer).await?;
        }
        for peer in leaves {
            self.leave(peer).await?;
        }
        Ok(())
    }

    /// Initial peers for a subnode created on our behalf: this subnode
    /// first, then every owner, then the rest of PeerSet.
    fn peer_hint(&self) -> Vec<SubnodeId> {
        let partition = self.id.partition();
        let owners = self
            .topology
            .owners_of(partition, false)
            .into_iter()
            .map(|node| SubnodeId::new(&node, partition));
        let peers: Vec<SubnodeId> = self.peers.lock().iter().cloned().collect();

        let mut hint = vec![self.id.clone()];
        for peer in owners.chain(peers) {
            if !hint.contains(&peer) {
                hint.push(peer);
            }
        }
        hint
    }

    async fn join(&self, peer: SubnodeId) -> Result<()> {
        let Some(_guard) = InFlight::claim(&self.in_flight, &peer) else {
            debug!(subnode = %self.id, peer = %peer, "Join already in flight");
            return Ok(());
        };
        self.membership.join(peer.clone()).await?;
        self.joins.fetch_add(1, Ordering::Relaxed);
        info!(subnode = %self.id, peer = %peer, "Joined peer");
        self.apply_peer_change(PeerChange::Joined(peer));
        Ok(())
    }

    async fn leave(&self, peer: SubnodeId) -> Result<()> {
        let Some(_guard) = InFlight::claim(&self.in_flight, &peer) else {
            debug!(subnode = %self.id, peer = %peer, "Leave already in flight");
            return Ok(());
        };
        self.membership.leave(peer.clone()).await?;
        self.leaves.fetch_add(1, Ordering::Relaxed);
        info!(subnode = %self.id, peer = %peer, "Removed dead peer");
        self.apply_peer_change(PeerChange::Left(peer));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuitterConfig;
    use crate::partitioning::HashRing;
    use crate::subnode::testing::{FakeMembership, FakeTopology};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn config() -> SubnodeConfig {
        SubnodeConfig::for_testing()
            .with_topology_retry(Duration::from_millis(20))
            .with_quitter_config(
                QuitterConfig::for_testing().with_poll_interval(Duration::from_secs(60)),
            )
    }

    fn reconciler(
        topology: Arc<FakeTopology>,
        membership: Arc<FakeMembership>,
    ) -> Arc<TopologyReconciler> {
        TopologyReconciler::new(
            SubnodeId::new("a:1", "p"),
            topology,
            membership,
            &config(),
            CancellationToken::new(),
        )
    }

    fn ids(nodes: &[&str]) -> BTreeSet<SubnodeId> {
        nodes.iter().map(|n| SubnodeId::new(n, "p")).collect()
    }

    async fn settle(reconciler: &TopologyReconciler) {
        for _ in 0..400 {
            if !reconciler.is_updating() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("reconciler never settled");
    }

    #[tokio::test]
    async fn test_pass_joins_owners() {
        let topology = FakeTopology::new("a:1", &["a:1", "b:1", "c:1"]);
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology.clone(), membership.clone());

        reconciler.topology_updated(false);
        settle(&reconciler).await;

        assert_eq!(reconciler.peers(), ids(&["b:1", "c:1"]));
        assert_eq!(membership.joined(), ids(&["b:1", "c:1"]).into_iter().collect::<Vec<_>>());
        let hints = topology.hints();
        assert!(hints.iter().all(|hint| hint[0] == SubnodeId::new("a:1", "p")));
        assert_eq!(reconciler.stats().passes, 1);
    }

    #[tokio::test]
    async fn test_hint_carries_whole_owner_set() {
        let topology = FakeTopology::new("b:1", &["a:1", "b:1", "c:1"]);
        let membership = FakeMembership::new("b:1", "p");
        let reconciler = TopologyReconciler::new(
            SubnodeId::new("b:1", "p"),
            topology.clone(),
            membership,
            &config(),
            CancellationToken::new(),
        );
        reconciler.peer_joined(SubnodeId::new("d:1", "p"));

        reconciler.topology_updated(false);
        settle(&reconciler).await;

        let expected: Vec<SubnodeId> = ["b:1", "a:1", "c:1", "d:1"]
            .iter()
            .map(|n| SubnodeId::new(n, "p"))
            .collect();
        let hints = topology.hints();
        assert_eq!(hints.len(), 2);
        assert!(hints.iter().all(|hint| *hint == expected));
    }

    #[tokio::test]
    async fn test_followers_only_reconcile_when_forced() {
        let topology = FakeTopology::new("a:1", &["a:1", "b:1", "c:1"]);
        let membership = FakeMembership::new("a:1", "p");
        membership.set_leader(false);
        let reconciler = reconciler(topology, membership.clone());

        reconciler.topology_updated(false);
        settle(&reconciler).await;
        assert!(membership.joined().is_empty());
        assert_eq!(reconciler.stats().passes, 0);

        reconciler.topology_updated(true);
        settle(&reconciler).await;
        assert_eq!(membership.joined().len(), 2);
    }

    #[tokio::test]
    async fn test_triggers_during_a_pass_coalesce() {
        let topology = FakeTopology::new("a:1", &["a:1", "b:1", "c:1"]);
        topology.set_ensure_delay(Duration::from_millis(40));
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology, membership);

        reconciler.topology_updated(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reconciler.is_updating());
        for _ in 0..9 {
            reconciler.topology_updated(false);
        }
        settle(&reconciler).await;

        let stats = reconciler.stats();
        assert_eq!(stats.passes, 2);
        assert_eq!(stats.max_concurrent_passes, 1);
    }

    #[tokio::test]
    async fn test_ensure_failure_aborts_pass() {
        let topology = FakeTopology::new("a:1", &["a:1", "b:1", "c:1"]);
        topology.set_unreachable("c:1", true);
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology.clone(), membership.clone());

        reconciler.topology_updated(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reconciler.stats().failed_passes >= 2);
        assert!(membership.joined().is_empty());
        assert!(reconciler.peers().is_empty());

        topology.set_unreachable("c:1", false);
        settle(&reconciler).await;
        assert_eq!(reconciler.peers(), ids(&["b:1", "c:1"]));
    }

    #[tokio::test]
    async fn test_only_dead_peers_are_removed() {
        let topology = FakeTopology::new("a:1", &["a:1", "b:1", "c:1"]);
        topology.set_live(&["a:1", "b:1", "c:1", "d:1"]);
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology.clone(), membership.clone());
        reconciler.peer_joined(SubnodeId::new("d:1", "p"));

        reconciler.topology_updated(false);
        settle(&reconciler).await;
        assert!(membership.left().is_empty());
        assert_eq!(reconciler.peers(), ids(&["b:1", "c:1", "d:1"]));

        topology.set_live(&["a:1", "b:1", "c:1"]);
        reconciler.topology_updated(false);
        settle(&reconciler).await;
        assert_eq!(membership.left(), vec![SubnodeId::new("d:1", "p")]);
        assert_eq!(reconciler.peers(), ids(&["b:1", "c:1"]));
    }

    #[tokio::test]
    async fn test_dead_group_members_are_removed() {
        let topology = FakeTopology::new("b:1", &["b:1", "c:1", "d:1"]);
        let membership = FakeMembership::new("b:1", "p");
        membership.set_members(ids(&["a:1", "b:1", "c:1"]).into_iter().collect());
        let reconciler = TopologyReconciler::new(
            SubnodeId::new("b:1", "p"),
            topology,
            membership.clone(),
            &config(),
            CancellationToken::new(),
        );

        reconciler.topology_updated(false);
        settle(&reconciler).await;
        assert_eq!(membership.left(), vec![SubnodeId::new("a:1", "p")]);
        assert_eq!(reconciler.peers(), ids(&["c:1", "d:1"]));
    }

    #[tokio::test]
    async fn test_own_id_never_enters_peer_set() {
        let topology = FakeTopology::new("a:1", &["a:1", "b:1"]);
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology, membership);

        reconciler.peer_joined(SubnodeId::new("a:1", "p"));
        reconciler.peer_joined(SubnodeId::new("b:1", "p"));
        assert_eq!(reconciler.peers(), ids(&["b:1"]));
        reconciler.peer_left(&SubnodeId::new("b:1", "p"));
        assert!(reconciler.peers().is_empty());
    }

    #[tokio::test]
    async fn test_non_owner_starts_quitter() {
        let topology = FakeTopology::new("a:1", &["b:1", "c:1", "d:1"]);
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology, membership);

        reconciler.topology_updated(false);
        assert!(reconciler.quitter().is_running());
        reconciler.stop();
    }

    /// Random ring churn: after every event the group converges to the
    /// owner set once displaced live peers have departed on their own.
    #[tokio::test]
    async fn test_converges_under_random_churn() {
        let pool = ["b:1", "c:1", "d:1", "e:1", "f:1", "g:1", "h:1"];
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: BTreeSet<&str> = pool[..3].iter().copied().collect();

        let topology = FakeTopology::new("a:1", &[]);
        let membership = FakeMembership::new("a:1", "p");
        let reconciler = reconciler(topology.clone(), membership);

        for step in 0..40 {
            let node = pool[rng.random_range(0..pool.len())];
            if live.contains(node) && live.len() > 1 {
                live.remove(node);
            } else {
                live.insert(node);
            }

            let mut ring = HashRing::new();
            ring.add_node("a:1");
            for node in &live {
                ring.add_node(node);
            }
            let owners = ring.owners(b"p", 3);
            let owner_refs: Vec<&str> = owners.iter().map(|s| s.as_str()).collect();
            let live_refs: Vec<&str> = std::iter::once("a:1").chain(live.iter().copied()).collect();
            topology.set_owners(&owner_refs);
            topology.set_live(&live_refs);

            reconciler.topology_updated(true);
            settle(&reconciler).await;

            // Live nodes outside the owner set leave through their quitter.
            for peer in reconciler.peers() {
                if !owners.iter().any(|o| o == peer.node()) {
                    reconciler.peer_left(&peer);
                }
            }

            let expected: BTreeSet<SubnodeId> = owners
                .iter()
                .filter(|o| o.as_str() != "a:1")
                .map(|o| SubnodeId::new(o, "p"))
                .collect();
            assert_eq!(reconciler.peers(), expected, "step {}", step);
        }
        reconciler.stop();
    }
}
