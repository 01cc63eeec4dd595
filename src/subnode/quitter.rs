//! Safe self-departure from a partition the node no longer owns.
//!
//! The quitter only removes the local subnode once every node of the new
//! owner set answers a ping, and once more after a grace delay re-checks
//! that the local node is still outside the owner set.

use crate::cluster::PartitionTopology;
use crate::config::QuitterConfig;
use crate::subnode::MembershipController;
use crate::types::{PartitionName, SubnodeId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the quitter is in its departure check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitterState {
    /// The node owns the partition; nothing to do.
    Idle,
    /// Waiting for the next poll.
    Polling,
    /// Pinging the new owner set.
    HealthCheck,
    /// Owner set healthy, waiting out the grace delay.
    PendingLeave,
    /// The subnode left its group.
    Left,
}

enum PollOutcome {
    Member,
    NotHealed,
    LeaveFailed,
    Left,
    Cancelled,
}

pub struct Quitter {
    partition: PartitionName,
    id: SubnodeId,
    topology: Arc<dyn PartitionTopology>,
    membership: Arc<dyn MembershipController>,
    config: QuitterConfig,
    state: Mutex<QuitterState>,
    running: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
}

impl Quitter {
    pub fn new(
        partition: PartitionName,
        id: SubnodeId,
        topology: Arc<dyn PartitionTopology>,
        membership: Arc<dyn MembershipController>,
        config: QuitterConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            partition,
            id,
            topology,
            membership,
            config,
            state: Mutex::new(QuitterState::Idle),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            cancel,
        }
    }

    pub fn state(&self) -> QuitterState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start polling. No-op while already polling or once stopped.
    pub fn start(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || *self.state.lock() == QuitterState::Left {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(subnode = %self.id, "Not an owner any more, starting quitter");
        self.set_state(QuitterState::Polling);

        let quitter = self.clone();
        tokio::spawn(async move { quitter.run().await });
    }

    /// The group's topology settled; poll now instead of at the next tick.
    pub fn topology_stabilized(&self) {
        if self.is_running() {
            self.wake.notify_one();
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wake.notified() => {}
            }

            match self.poll().await {
                PollOutcome::Member => {
                    debug!(subnode = %self.id, "Back in the owner set, quitter idle");
                    self.set_state(QuitterState::Idle);
                    self.running.store(false, Ordering::SeqCst);
                    // A start issued since the poll found `running` still set
                    // and returned; ownership may be gone again.
                    if !self.part_of_partition() {
                        self.start();
                    }
                    return;
                }
                PollOutcome::Left => {
                    info!(subnode = %self.id, "Left partition");
                    self.set_state(QuitterState::Left);
                    break;
                }
                PollOutcome::Cancelled => break,
                PollOutcome::NotHealed | PollOutcome::LeaveFailed => {
                    self.set_state(QuitterState::Polling);
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn poll(&self) -> PollOutcome {
        if self.part_of_partition() {
            return PollOutcome::Member;
        }

        self.set_state(QuitterState::HealthCheck);
        if !self.partition_healed().await {
            debug!(subnode = %self.id, "Owner set not healthy yet, retrying later");
            return PollOutcome::NotHealed;
        }

        self.set_state(QuitterState::PendingLeave);
        tokio::select! {
            _ = self.cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(self.config.grace_delay) => {}
        }
        if self.part_of_partition() {
            return PollOutcome::Member;
        }

        info!(subnode = %self.id, partition = %self.partition, "Quitting partition");
        match self.membership.leave_self().await {
            Ok(()) => PollOutcome::Left,
            Err(e) => {
                warn!(subnode = %self.id, error = %e, "Failed to leave partition, will retry");
                PollOutcome::LeaveFailed
            }
        }
    }

    fn part_of_partition(&self) -> bool {
        let me = self.topology.whoami();
        self.topology
            .owners_of(&self.partition, false)
            .iter()
            .any(|n| *n == me)
    }

    async fn partition_healed(&self) -> bool {
        let owners = self.topology.owners_of(&self.partition, false);
        if owners.is_empty() {
            return false;
        }
        let pings = owners.iter().map(|node| self.topology.ping(node));
        futures::future::join_all(pings)
            .await
            .into_iter()
            .all(|result| result.is_ok())
    }

    fn set_state(&self, state: QuitterState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(subnode = %self.id, from = ?*current, to = ?state, "Quitter state");
            *current = state;
        }
    }
}
