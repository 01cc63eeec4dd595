//! Scripted collaborators for reconciler and quitter tests.

use crate::cluster::PartitionTopology;
use crate::error::{Error, Result};
use crate::subnode::MembershipController;
use crate::types::{NodeId, SubnodeId};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A topology whose owner set, liveness and reachability are set by the test.
pub(crate) struct FakeTopology {
    me: NodeId,
    owners: Mutex<Vec<NodeId>>,
    /// Owner sets taken one per `owners_of` call before `owners` applies.
    queued_owners: Mutex<VecDeque<Vec<NodeId>>>,
    live: Mutex<HashSet<NodeId>>,
    unreachable: Mutex<HashSet<NodeId>>,
    pinged: Mutex<Vec<NodeId>>,
    hints: Mutex<Vec<Vec<SubnodeId>>>,
    ensure_delay: Mutex<Duration>,
}

impl FakeTopology {
    pub fn new(me: &str, owners: &[&str]) -> Arc<Self> {
        let live = std::iter::once(me)
            .chain(owners.iter().copied())
            .map(str::to_string)
            .collect();
        Arc::new(Self {
            me: me.to_string(),
            owners: Mutex::new(owners.iter().map(|o| o.to_string()).collect()),
            queued_owners: Mutex::new(VecDeque::new()),
            live: Mutex::new(live),
            unreachable: Mutex::new(HashSet::new()),
            pinged: Mutex::new(Vec::new()),
            hints: Mutex::new(Vec::new()),
            ensure_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_owners(&self, owners: &[&str]) {
        *self.owners.lock() = owners.iter().map(|o| o.to_string()).collect();
    }

    /// Answer the next `owners_of` calls with these owner sets, in order.
    /// The last one sticks.
    pub fn queue_owners(&self, sets: &[&[&str]]) {
        let mut queue = self.queued_owners.lock();
        for set in sets {
            queue.push_back(set.iter().map(|o| o.to_string()).collect());
        }
    }

    pub fn set_live(&self, nodes: &[&str]) {
        *self.live.lock() = nodes.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(node.to_string());
        } else {
            set.remove(node);
        }
    }

    pub fn set_ensure_delay(&self, delay: Duration) {
        *self.ensure_delay.lock() = delay;
    }

    pub fn pinged(&self) -> Vec<NodeId> {
        self.pinged.lock().clone()
    }

    /// Peer hints passed to every ensure call so far.
    pub fn hints(&self) -> Vec<Vec<SubnodeId>> {
        self.hints.lock().clone()
    }

    fn check_reachable(&self, peer: &str, payload: &str) -> Result<()> {
        if self.unreachable.lock().contains(peer) {
            Err(Error::Timeout {
                peer: peer.to_string(),
                payload: payload.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl PartitionTopology for FakeTopology {
    fn whoami(&self) -> NodeId {
        self.me.clone()
    }

    fn owners_of(&self, _partition: &str, exclude_self: bool) -> Vec<NodeId> {
        let mut owners = {
            let mut current = self.owners.lock();
            if let Some(next) = self.queued_owners.lock().pop_front() {
                *current = next;
            }
            current.clone()
        };
        if exclude_self {
            owners.retain(|n| *n != self.me);
        }
        owners
    }

    fn is_live(&self, node: &str) -> bool {
        self.live.lock().contains(node)
    }

    async fn ensure_remote_partition(
        &self,
        partition: &str,
        peer: &str,
        peer_hint: Vec<SubnodeId>,
    ) -> Result<SubnodeId> {
        self.hints.lock().push(peer_hint);
        let delay = *self.ensure_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable(peer, "ensure partition")?;
        Ok(SubnodeId::new(peer, partition))
    }

    async fn ping(&self, peer: &str) -> Result<()> {
        self.pinged.lock().push(peer.to_string());
        self.check_reachable(peer, "ping")
    }
}

/// Records membership changes instead of applying them.
pub(crate) struct FakeMembership {
    id: SubnodeId,
    leader: AtomicBool,
    joined: Mutex<Vec<SubnodeId>>,
    left: Mutex<Vec<SubnodeId>>,
    members: Mutex<Vec<SubnodeId>>,
    leave_failures: Mutex<Option<(usize, Error)>>,
    leave_attempts: AtomicUsize,
}

impl FakeMembership {
    pub fn new(node: &str, partition: &str) -> Arc<Self> {
        Arc::new(Self {
            id: SubnodeId::new(node, partition),
            leader: AtomicBool::new(true),
            joined: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            members: Mutex::new(Vec::new()),
            leave_failures: Mutex::new(None),
            leave_attempts: AtomicUsize::new(0),
        })
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Members reported as known to consensus.
    pub fn set_members(&self, members: Vec<SubnodeId>) {
        *self.members.lock() = members;
    }

    pub fn joined(&self) -> Vec<SubnodeId> {
        self.joined.lock().clone()
    }

    pub fn left(&self) -> Vec<SubnodeId> {
        self.left.lock().clone()
    }

    /// Fail the next `count` leaves with `error`.
    pub fn fail_leaves(&self, count: usize, error: Error) {
        *self.leave_failures.lock() = Some((count, error));
    }

    pub fn leave_attempts(&self) -> usize {
        self.leave_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MembershipController for FakeMembership {
    fn id(&self) -> &SubnodeId {
        &self.id
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn members(&self) -> Vec<SubnodeId> {
        self.members.lock().clone()
    }

    async fn join(&self, peer: SubnodeId) -> Result<()> {
        self.joined.lock().push(peer);
        Ok(())
    }

    async fn leave(&self, peer: SubnodeId) -> Result<()> {
        self.leave_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.leave_failures.lock();
            if let Some((count, error)) = failures.as_mut() {
                if *count > 0 {
                    *count -= 1;
                    return Err(error.clone());
                }
            }
        }
        self.left.lock().push(peer);
        Ok(())
    }
}
