//! Configuration types for shardkeeper nodes.

use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address this node is known by in the ring.
    pub address: NodeId,

    /// Ring-wide request and partition-management settings.
    pub cluster: ClusterConfig,

    /// Per-partition subnode settings.
    pub subnode: SubnodeConfig,

    /// How long a secondary replica stays weakened right after it starts,
    /// so that the designated leader wins the first election.
    pub secondary_weaken_at_startup: Duration,

    /// How long the designated leader of a new subnode waits to be elected
    /// before it settles for whatever role it holds.
    pub leader_election_wait: Duration,

    /// Ring events arriving within this window collapse into one
    /// topology update.
    pub topology_debounce: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            cluster: ClusterConfig::default(),
            subnode: SubnodeConfig::default(),
            secondary_weaken_at_startup: Duration::from_millis(2000),
            leader_election_wait: Duration::from_millis(5000),
            topology_debounce: Duration::from_millis(100),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for the node at `address`.
    pub fn new(address: impl Into<NodeId>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Short timers for in-process clusters.
    pub fn for_testing(address: impl Into<NodeId>) -> Self {
        Self {
            address: address.into(),
            cluster: ClusterConfig::for_testing(),
            subnode: SubnodeConfig::for_testing(),
            secondary_weaken_at_startup: Duration::from_millis(200),
            leader_election_wait: Duration::from_millis(1000),
            topology_debounce: Duration::from_millis(20),
        }
    }

    /// Set cluster configuration.
    pub fn with_cluster_config(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Set subnode configuration.
    pub fn with_subnode_config(mut self, subnode: SubnodeConfig) -> Self {
        self.subnode = subnode;
        self
    }

    /// Set the replica count beyond the leader.
    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        self.cluster.redundancy = redundancy;
        self
    }

    pub fn with_secondary_weaken_at_startup(mut self, duration: Duration) -> Self {
        self.secondary_weaken_at_startup = duration;
        self
    }

    pub fn with_leader_election_wait(mut self, wait: Duration) -> Self {
        self.leader_election_wait = wait;
        self
    }

    pub fn with_topology_debounce(mut self, debounce: Duration) -> Self {
        self.topology_debounce = debounce;
        self
    }
}

/// Cluster-level request and partition-management configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Replicas per partition beyond the leader.
    pub redundancy: usize,

    /// Timeout for a single peer request.
    pub request_timeout: Duration,

    /// Wait before retrying a request a peer answered with a warning.
    pub retry_on_warning: Duration,

    /// Retries for leader-routed requests.
    pub max_retries: u32,

    /// Wait between leader-routed retries.
    pub retry_wait: Duration,

    /// Timeout for ensure/locate partition requests.
    pub remote_partition_address_timeout: Duration,

    /// Wait between ensure/locate partition retries.
    pub remote_partition_address_retry: Duration,

    /// Retries for ensure/locate partition requests.
    pub remote_partition_address_max_retries: u32,

    /// Timeout for a liveness ping.
    pub ping_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            redundancy: 2,
            request_timeout: Duration::from_millis(5000),
            retry_on_warning: Duration::from_millis(500),
            max_retries: 10,
            retry_wait: Duration::from_millis(200),
            remote_partition_address_timeout: Duration::from_millis(10_000),
            remote_partition_address_retry: Duration::from_millis(500),
            remote_partition_address_max_retries: 10,
            ping_timeout: Duration::from_millis(1000),
        }
    }
}

impl ClusterConfig {
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_millis(1000),
            retry_on_warning: Duration::from_millis(20),
            max_retries: 30,
            retry_wait: Duration::from_millis(50),
            remote_partition_address_timeout: Duration::from_millis(2000),
            remote_partition_address_retry: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn with_retry_on_warning(mut self, wait: Duration) -> Self {
        self.retry_on_warning = wait;
        self
    }

    pub fn with_remote_partition_address_max_retries(mut self, retries: u32) -> Self {
        self.remote_partition_address_max_retries = retries;
        self
    }

    pub fn with_remote_partition_address_retry(mut self, wait: Duration) -> Self {
        self.remote_partition_address_retry = wait;
        self
    }

    pub fn with_remote_partition_address_timeout(mut self, timeout: Duration) -> Self {
        self.remote_partition_address_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Size of a partition's owner set.
    pub fn owner_count(&self) -> usize {
        self.redundancy + 1
    }
}

/// Per-partition subnode configuration.
#[derive(Debug, Clone)]
pub struct SubnodeConfig {
    /// When a candidate sees the ring leader alive, weaken for this long.
    pub weaken_when_candidate_and_leader_up: Duration,

    /// Backoff before a failed reconciliation pass is retried.
    pub topology_retry: Duration,

    pub quitter: QuitterConfig,
}

impl Default for SubnodeConfig {
    fn default() -> Self {
        Self {
            weaken_when_candidate_and_leader_up: Duration::from_millis(1000),
            topology_retry: Duration::from_millis(1000),
            quitter: QuitterConfig::default(),
        }
    }
}

impl SubnodeConfig {
    pub fn for_testing() -> Self {
        Self {
            weaken_when_candidate_and_leader_up: Duration::from_millis(150),
            topology_retry: Duration::from_millis(100),
            quitter: QuitterConfig::for_testing(),
        }
    }

    pub fn with_topology_retry(mut self, backoff: Duration) -> Self {
        self.topology_retry = backoff;
        self
    }

    pub fn with_quitter_config(mut self, quitter: QuitterConfig) -> Self {
        self.quitter = quitter;
        self
    }
}

/// Timers for the self-departure check.
#[derive(Debug, Clone)]
pub struct QuitterConfig {
    /// Interval between membership polls.
    pub poll_interval: Duration,

    /// Delay between a healthy check and the actual leave.
    pub grace_delay: Duration,
}

impl Default for QuitterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(6000),
            grace_delay: Duration::from_millis(6000),
        }
    }
}

impl QuitterConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            grace_delay: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_delay(mut self, delay: Duration) -> Self {
        self.grace_delay = delay;
        self
    }
}
