//! In-process consensus groups.
//!
//! Every member of every group lives in one shared table guarded by a single
//! lock, and each running member is driven by a ticker task. The election
//! rules are deliberately small:
//!
//! - a follower that sees no live leader becomes candidate after a
//!   randomized election timeout
//! - a candidate wins when a majority of its view votes for it; a voter must
//!   be running, know the candidate, see no live leader of its own and not be
//!   ahead of the candidate's applied index
//! - a weakened member never stands for election until the weaken expires
//! - a leader that loses a running majority steps down
//!
//! Commands and membership changes issued on a follower are executed by the
//! leader it follows. Writes are applied to every running member of the
//! leader's view; a joining member first installs the leader's snapshot.

use crate::consensus::{Consensus, ConsensusEvent, ConsensusFactory, PartitionStateMachine};
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{Command, CommandResult, ConsensusRole, SubnodeId};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Timing of the simulated groups.
#[derive(Debug, Clone)]
pub struct LocalConsensusConfig {
    pub tick_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// How long a candidate collects votes before counting them.
    pub candidate_delay: Duration,
}

impl Default for LocalConsensusConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            election_timeout_min: Duration::from_millis(60),
            election_timeout_max: Duration::from_millis(120),
            candidate_delay: Duration::from_millis(20),
        }
    }
}

impl LocalConsensusConfig {
    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// Shared table of every simulated consensus member.
#[derive(Clone)]
pub struct LocalConsensusNetwork {
    inner: Arc<SimInner>,
}

struct SimInner {
    config: LocalConsensusConfig,
    generations: AtomicU64,
    members: Mutex<Members>,
}

type Members = HashMap<SubnodeId, MemberState>;

struct MemberState {
    /// Distinguishes a recreated member from its predecessor.
    generation: u64,
    role: ConsensusRole,
    running: bool,
    /// Removed from its group; never stands for election again.
    evicted: bool,
    /// Group membership as known to this member, itself included.
    view: BTreeSet<SubnodeId>,
    state_machine: PartitionStateMachine,
    weakened_until: Option<Instant>,
    election_deadline: Instant,
    candidate_until: Instant,
    events: mpsc::UnboundedSender<ConsensusEvent>,
}

impl MemberState {
    fn is_active(&self) -> bool {
        self.running && !self.evicted
    }

    fn set_role(&mut self, id: &SubnodeId, role: ConsensusRole) {
        if self.role != role {
            debug!(subnode = %id, from = ?self.role, to = ?role, "Role change");
            self.role = role;
            let _ = self.events.send(ConsensusEvent::NewState(role));
        }
    }

    fn notify(&self, event: ConsensusEvent) {
        let _ = self.events.send(event);
    }
}

/// The leader `id` currently follows: itself when it leads, otherwise an
/// active leader in its view that also knows about it.
fn live_leader(members: &Members, id: &SubnodeId) -> Option<SubnodeId> {
    let me = members.get(id).filter(|m| m.is_active())?;
    if me.role == ConsensusRole::Leader {
        return Some(id.clone());
    }
    me.view
        .iter()
        .filter(|p| *p != id)
        .find(|p| {
            members
                .get(*p)
                .map(|l| l.is_active() && l.role == ConsensusRole::Leader && l.view.contains(id))
                .unwrap_or(false)
        })
        .cloned()
}

fn has_quorum(members: &Members, view: &BTreeSet<SubnodeId>) -> bool {
    let active = view
        .iter()
        .filter(|p| members.get(*p).map(|m| m.is_active()).unwrap_or(false))
        .count();
    active * 2 > view.len()
}

fn wins_election(members: &Members, id: &SubnodeId) -> bool {
    let Some(me) = members.get(id) else {
        return false;
    };
    let applied = me.state_machine.applied_index();
    let votes = me
        .view
        .iter()
        .filter(|p| {
            if *p == id {
                return true;
            }
            members
                .get(*p)
                .map(|voter| {
                    voter.is_active()
                        && voter.role != ConsensusRole::Leader
                        && voter.view.contains(id)
                        && voter.state_machine.applied_index() <= applied
                        && live_leader(members, p).is_none()
                })
                .unwrap_or(false)
        })
        .count();
    votes * 2 > me.view.len()
}

/// Resolve the leader that executes operations issued on `id`.
fn acting_leader(members: &Members, id: &SubnodeId) -> Result<SubnodeId> {
    let leader = live_leader(members, id).ok_or(Error::NotLeader { leader: None })?;
    let view = members
        .get(&leader)
        .map(|l| l.view.clone())
        .unwrap_or_default();
    if !has_quorum(members, &view) {
        return Err(Error::Consensus(format!("{} has no quorum", leader)));
    }
    Ok(leader)
}

impl SimInner {
    /// One step of the member's timers. Returns false once the member is
    /// gone or replaced.
    fn tick(&self, id: &SubnodeId, generation: u64) -> bool {
        let now = Instant::now();
        let timeout = self.config.random_election_timeout();
        let mut members = self.members.lock();

        let (role, leader) = match members.get(id) {
            Some(m) if m.generation == generation => {
                if !m.is_active() {
                    return m.running;
                }
                (m.role, live_leader(&members, id))
            }
            _ => return false,
        };

        match role {
            ConsensusRole::Weakened => {
                if let Some(m) = members.get_mut(id) {
                    if m.weakened_until.map(|t| t <= now).unwrap_or(true) {
                        m.weakened_until = None;
                        m.election_deadline = now + timeout;
                        m.set_role(id, ConsensusRole::Follower);
                    }
                }
            }
            ConsensusRole::Leader => {
                let view = members.get(id).map(|m| m.view.clone()).unwrap_or_default();
                if !has_quorum(&members, &view) {
                    info!(subnode = %id, "Leader lost quorum, stepping down");
                    if let Some(m) = members.get_mut(id) {
                        m.election_deadline = now + timeout;
                        m.set_role(id, ConsensusRole::Follower);
                    }
                }
            }
            ConsensusRole::Follower => {
                if let Some(m) = members.get_mut(id) {
                    if leader.is_some() {
                        m.election_deadline = now + timeout;
                    } else if now >= m.election_deadline {
                        m.candidate_until = now + self.config.candidate_delay;
                        m.set_role(id, ConsensusRole::Candidate);
                    }
                }
            }
            ConsensusRole::Candidate => {
                if leader.is_some() {
                    if let Some(m) = members.get_mut(id) {
                        m.election_deadline = now + timeout;
                        m.set_role(id, ConsensusRole::Follower);
                    }
                    return true;
                }
                let ready = members.get(id).map(|m| now >= m.candidate_until).unwrap_or(false);
                if ready {
                    let won = wins_election(&members, id);
                    if let Some(m) = members.get_mut(id) {
                        if won {
                            info!(subnode = %id, "Elected leader");
                            m.set_role(id, ConsensusRole::Leader);
                        } else {
                            m.candidate_until = now + timeout;
                        }
                    }
                }
            }
        }
        true
    }
}

impl LocalConsensusNetwork {
    pub fn new(config: LocalConsensusConfig) -> Self {
        Self {
            inner: Arc::new(SimInner {
                config,
                generations: AtomicU64::new(1),
                members: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current role of a member.
    pub fn role_of(&self, id: &SubnodeId) -> Option<ConsensusRole> {
        self.inner.members.lock().get(id).map(|m| m.role)
    }

    /// Group view of a member.
    pub fn view_of(&self, id: &SubnodeId) -> Vec<SubnodeId> {
        self.inner
            .members
            .lock()
            .get(id)
            .map(|m| m.view.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every active leader whose view contains `id`, or `id` itself if it leads.
    pub fn leaders_for(&self, id: &SubnodeId) -> Vec<SubnodeId> {
        let members = self.inner.members.lock();
        members
            .iter()
            .filter(|(other, m)| {
                m.is_active()
                    && m.role == ConsensusRole::Leader
                    && (*other == id || m.view.contains(id))
            })
            .map(|(other, _)| other.clone())
            .collect()
    }
}

impl Default for LocalConsensusNetwork {
    fn default() -> Self {
        Self::new(LocalConsensusConfig::default())
    }
}

impl ConsensusFactory for LocalConsensusNetwork {
    fn create(
        &self,
        id: SubnodeId,
        peers: Vec<SubnodeId>,
        storage: Arc<dyn Storage>,
        events: mpsc::UnboundedSender<ConsensusEvent>,
    ) -> Result<Arc<dyn Consensus>> {
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let mut view: BTreeSet<SubnodeId> = peers.into_iter().collect();
        view.insert(id.clone());
        debug!(subnode = %id, ?view, "Creating consensus member");

        let now = Instant::now();
        let state = MemberState {
            generation,
            role: ConsensusRole::Follower,
            running: false,
            evicted: false,
            view,
            state_machine: PartitionStateMachine::new(storage),
            weakened_until: None,
            election_deadline: now,
            candidate_until: now,
            events,
        };
        self.inner.members.lock().insert(id.clone(), state);

        Ok(Arc::new(LocalConsensus {
            id,
            generation,
            inner: self.inner.clone(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }))
    }
}

/// A member handle returned by [`LocalConsensusNetwork`].
pub struct LocalConsensus {
    id: SubnodeId,
    generation: u64,
    inner: Arc<SimInner>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl LocalConsensus {
    fn check_running(&self, members: &Members) -> Result<()> {
        match members.get(&self.id) {
            Some(m) if m.generation == self.generation && m.running => Ok(()),
            _ => Err(Error::Stopped),
        }
    }

    fn is_current(&self, members: &Members) -> bool {
        members
            .get(&self.id)
            .map(|m| m.generation == self.generation)
            .unwrap_or(false)
    }
}

impl Drop for LocalConsensus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl Consensus for LocalConsensus {
    fn id(&self) -> &SubnodeId {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut members = self.inner.members.lock();
            let timeout = self.inner.config.random_election_timeout();
            match members.get_mut(&self.id) {
                Some(m) if m.generation == self.generation => {
                    m.running = true;
                    m.election_deadline = Instant::now() + timeout;
                }
                _ => return Err(Error::Stopped),
            }
        }

        let inner = self.inner.clone();
        let id = self.id.clone();
        let generation = self.generation;
        let cancel = self.cancel.clone();
        let tick = self.inner.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !inner.tick(&id, generation) {
                            break;
                        }
                    }
                }
            }
            debug!(subnode = %id, "Consensus ticker stopped");
        });
        debug!(subnode = %self.id, "Consensus started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let mut members = self.inner.members.lock();
        if let Some(m) = members.get_mut(&self.id) {
            if m.generation == self.generation {
                m.running = false;
                m.role = ConsensusRole::Follower;
            }
        }
        debug!(subnode = %self.id, "Consensus stopped");
        Ok(())
    }

    async fn command(&self, command: Command) -> Result<CommandResult> {
        let members = self.inner.members.lock();
        self.check_running(&members)?;
        let leader_id = acting_leader(&members, &self.id)?;
        let leader = members
            .get(&leader_id)
            .ok_or(Error::NotLeader { leader: None })?;

        if !command.is_write() {
            return leader.state_machine.read(&command);
        }

        let index = leader.state_machine.applied_index() + 1;
        for peer in &leader.view {
            if let Some(m) = members.get(peer).filter(|m| m.is_active()) {
                m.state_machine.apply(index, &command)?;
            }
        }
        Ok(CommandResult::Done)
    }

    async fn join(&self, peer: SubnodeId) -> Result<()> {
        let mut members = self.inner.members.lock();
        self.check_running(&members)?;
        let leader_id = acting_leader(&members, &self.id)?;
        let (leader_view, index) = match members.get(&leader_id) {
            Some(l) => (l.view.clone(), l.state_machine.applied_index()),
            None => return Err(Error::NotLeader { leader: None }),
        };

        let target = members
            .get(&peer)
            .ok_or_else(|| Error::Consensus(format!("unknown member {}", peer)))?;
        if leader_view.contains(&peer) && target.view == leader_view && !target.evicted {
            return Ok(());
        }

        if target.state_machine.applied_index() != index {
            let entries = members
                .get(&leader_id)
                .map(|l| l.state_machine.snapshot())
                .transpose()?
                .unwrap_or_default();
            target.state_machine.install_snapshot(index, entries)?;
        }

        let mut new_view = leader_view.clone();
        new_view.insert(peer.clone());
        for p in &new_view {
            if let Some(m) = members.get_mut(p) {
                m.view = new_view.clone();
                if *p == peer {
                    m.evicted = false;
                }
            }
        }

        if !leader_view.contains(&peer) {
            for p in &new_view {
                if let Some(m) = members.get(p) {
                    m.notify(ConsensusEvent::Joined(peer.clone()));
                }
            }
            info!(leader = %leader_id, peer = %peer, "Member joined group");
        }
        Ok(())
    }

    async fn leave(&self, peer: SubnodeId) -> Result<()> {
        let mut members = self.inner.members.lock();
        self.check_running(&members)?;
        let leader_id = acting_leader(&members, &self.id)?;
        let leader_view = members
            .get(&leader_id)
            .map(|l| l.view.clone())
            .unwrap_or_default();
        if !leader_view.contains(&peer) {
            return Ok(());
        }

        let mut new_view = leader_view.clone();
        new_view.remove(&peer);
        for p in &new_view {
            if let Some(m) = members.get_mut(p) {
                m.view = new_view.clone();
            }
        }
        if let Some(m) = members.get_mut(&peer) {
            m.evicted = true;
            m.view = BTreeSet::from([peer.clone()]);
            m.set_role(&peer, ConsensusRole::Follower);
        }

        for p in &leader_view {
            if let Some(m) = members.get(p) {
                m.notify(ConsensusEvent::Left(peer.clone()));
            }
        }
        info!(leader = %leader_id, peer = %peer, "Member left group");
        Ok(())
    }

    fn weaken(&self, duration: Duration) {
        let mut members = self.inner.members.lock();
        if !self.is_current(&members) {
            return;
        }
        if let Some(m) = members.get_mut(&self.id).filter(|m| m.is_active()) {
            debug!(subnode = %self.id, ?duration, "Weakening");
            m.weakened_until = Some(Instant::now() + duration);
            m.set_role(&self.id, ConsensusRole::Weakened);
        }
    }

    fn role(&self) -> ConsensusRole {
        let members = self.inner.members.lock();
        members
            .get(&self.id)
            .filter(|m| m.generation == self.generation)
            .map(|m| m.role)
            .unwrap_or(ConsensusRole::Follower)
    }

    fn leader(&self) -> Option<SubnodeId> {
        let members = self.inner.members.lock();
        if !self.is_current(&members) {
            return None;
        }
        live_leader(&members, &self.id)
    }

    fn peers(&self) -> Vec<SubnodeId> {
        let members = self.inner.members.lock();
        members
            .get(&self.id)
            .filter(|m| m.generation == self.generation)
            .map(|m| m.view.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tokio::time::sleep;

    fn id(node: &str) -> SubnodeId {
        SubnodeId::new(node, "p")
    }

    fn create(
        network: &LocalConsensusNetwork,
        node: &str,
        peers: &[&str],
    ) -> (Arc<dyn Consensus>, mpsc::UnboundedReceiver<ConsensusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consensus = network
            .create(
                id(node),
                peers.iter().map(|p| id(p)).collect(),
                Arc::new(MemoryStorage::new()),
                tx,
            )
            .unwrap();
        (consensus, rx)
    }

    async fn wait_for_role(consensus: &Arc<dyn Consensus>, role: ConsensusRole) {
        for _ in 0..200 {
            if consensus.role() == role {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never became {:?}", consensus.id(), role);
    }

    #[tokio::test]
    async fn test_single_member_elects_itself() {
        let network = LocalConsensusNetwork::default();
        let (a, mut events) = create(&network, "a:1", &[]);
        a.start().await.unwrap();

        wait_for_role(&a, ConsensusRole::Leader).await;
        assert_eq!(a.leader(), Some(id("a:1")));

        let mut saw_leader = false;
        while let Ok(event) = events.try_recv() {
            if event == ConsensusEvent::NewState(ConsensusRole::Leader) {
                saw_leader = true;
            }
        }
        assert!(saw_leader);
    }

    #[tokio::test]
    async fn test_weakened_member_does_not_lead() {
        let network = LocalConsensusNetwork::default();
        let (a, _ea) = create(&network, "a:1", &["a:1", "b:1"]);
        let (b, _eb) = create(&network, "b:1", &["a:1", "b:1"]);
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.weaken(Duration::from_secs(5));

        wait_for_role(&a, ConsensusRole::Leader).await;
        assert_eq!(b.role(), ConsensusRole::Weakened);
        assert_eq!(b.leader(), Some(id("a:1")));
    }

    #[tokio::test]
    async fn test_commands_replicate_and_forward() {
        let network = LocalConsensusNetwork::default();
        let (a, _ea) = create(&network, "a:1", &["a:1", "b:1"]);
        let (b, _eb) = create(&network, "b:1", &["a:1", "b:1"]);
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.weaken(Duration::from_secs(5));
        wait_for_role(&a, ConsensusRole::Leader).await;

        b.command(Command::put(b"k".to_vec(), b"v".to_vec())).await.unwrap();
        let value = a.command(Command::get(b"k".to_vec())).await.unwrap();
        assert_eq!(value.into_value(), Some(b"v".to_vec()));

        b.stop().await.unwrap();
        // One of two members left: no quorum, and the leader steps down soon.
        let err = a.command(Command::get(b"k".to_vec())).await.unwrap_err();
        assert!(matches!(err, Error::Consensus(_) | Error::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_join_syncs_snapshot_and_leave_evicts() {
        let network = LocalConsensusNetwork::default();
        let (a, mut events) = create(&network, "a:1", &[]);
        a.start().await.unwrap();
        wait_for_role(&a, ConsensusRole::Leader).await;
        a.command(Command::put(b"k".to_vec(), b"v".to_vec())).await.unwrap();

        let (b, mut b_events) = create(&network, "b:1", &["a:1"]);
        b.start().await.unwrap();
        b.weaken(Duration::from_secs(5));
        a.join(id("b:1")).await.unwrap();

        assert_eq!(network.view_of(&id("a:1")), vec![id("a:1"), id("b:1")]);
        assert_eq!(b.peers(), vec![id("a:1"), id("b:1")]);
        let value = b.command(Command::get(b"k".to_vec())).await.unwrap();
        assert_eq!(value.into_value(), Some(b"v".to_vec()));

        // Joining twice is a no-op.
        a.join(id("b:1")).await.unwrap();

        b.leave(id("b:1")).await.unwrap();
        assert_eq!(a.peers(), vec![id("a:1")]);

        let mut a_seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            a_seen.push(event);
        }
        assert!(a_seen.contains(&ConsensusEvent::Joined(id("b:1"))));
        assert!(a_seen.contains(&ConsensusEvent::Left(id("b:1"))));

        let mut b_seen = Vec::new();
        while let Ok(event) = b_events.try_recv() {
            b_seen.push(event);
        }
        assert!(b_seen.contains(&ConsensusEvent::Left(id("b:1"))));
    }

    #[tokio::test]
    async fn test_new_leader_after_leader_stops() {
        let network = LocalConsensusNetwork::default();
        let peers = ["a:1", "b:1", "c:1"];
        let (a, _ea) = create(&network, "a:1", &peers);
        let (b, _eb) = create(&network, "b:1", &peers);
        let (c, _ec) = create(&network, "c:1", &peers);
        for member in [&a, &b, &c] {
            member.start().await.unwrap();
        }
        b.weaken(Duration::from_millis(300));
        c.weaken(Duration::from_millis(300));
        wait_for_role(&a, ConsensusRole::Leader).await;

        a.stop().await.unwrap();
        for _ in 0..300 {
            if b.role() == ConsensusRole::Leader || c.role() == ConsensusRole::Leader {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let leaders = network.leaders_for(&id("b:1"));
        assert_eq!(leaders.len(), 1);
        assert_ne!(leaders[0], id("a:1"));
    }
}
