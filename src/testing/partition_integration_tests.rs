use crate::error::Result;
use crate::node::{PartitionRequest, RequestHandler};
use crate::partitioning::HashRing;
use crate::storage::Storage;
use crate::testing::{wait_for, wait_for_result, TestCluster};
use crate::types::{NodeId, SubnodeId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(10);

fn addresses(count: usize) -> Vec<NodeId> {
    (0..count).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect()
}

/// A partition whose owner set takes in the node added after `size`
/// nodes, without that node becoming its ring leader. Returns the
/// partition and the owner it displaces.
fn displaced_partition(size: usize) -> (String, NodeId) {
    let nodes = addresses(size + 1);
    let (existing, added) = nodes.split_at(size);
    let mut before = HashRing::new();
    for node in existing {
        before.add_node(node);
    }
    let mut after = before.clone();
    after.add_node(&added[0]);

    for i in 0..10_000 {
        let name = format!("partition-{}", i);
        let old = before.owners(name.as_bytes(), 3);
        let new = after.owners(name.as_bytes(), 3);
        if new.contains(&added[0]) && new[0] != added[0] {
            let displaced = old.iter().find(|n| !new.contains(n)).cloned();
            if let Some(displaced) = displaced {
                return (name, displaced);
            }
        }
    }
    panic!("no partition takes in {}", added[0]);
}

fn has_value(cluster: &TestCluster, subnode: &SubnodeId, key: &[u8], value: &[u8]) -> bool {
    cluster
        .storage(subnode)
        .and_then(|s| s.get(key).ok().flatten())
        .map(|v| v == value)
        .unwrap_or(false)
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc1_single_node_put_get() {
    let cluster = TestCluster::start(1).await.unwrap();
    let node = &cluster.nodes()[0];

    let users = node.partition("users");
    users.put(b"alice".to_vec(), b"1".to_vec()).await.unwrap();
    assert_eq!(users.get(b"alice".to_vec()).await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(users.get(b"bob".to_vec()).await.unwrap(), None);

    assert!(cluster.converged("users"));
    assert_eq!(node.active_partitions(), vec!["users".to_string()]);
    cluster.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc2_write_through_non_owner_replicates_to_owners() {
    let cluster = TestCluster::start(5).await.unwrap();
    let owners = cluster.owners("users");
    assert_eq!(owners.len(), 3);

    let client = cluster.non_owner("users").unwrap();
    assert!(!owners.contains(&client.whoami()));
    client
        .partition("users")
        .put(b"alice".to_vec(), b"1".to_vec())
        .await
        .unwrap();

    assert!(wait_for(CONVERGENCE, || cluster.converged("users")).await);
    for owner in cluster.owner_subnodes("users") {
        assert!(
            wait_for(CONVERGENCE, || has_value(&cluster, &owner, b"alice", b"1")).await,
            "{} missing the write",
            owner
        );
    }
    assert!(client.local_subnode("users").is_none());

    let info = client.partition_info("users").await.unwrap();
    assert_eq!(info.node_id, owners[0]);
    let mut peers = info.peers.clone();
    peers.sort();
    assert_eq!(peers, cluster.owner_subnodes("users"));
    cluster.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc3_leader_failure_elects_from_owner_set() {
    let mut cluster = TestCluster::start(5).await.unwrap();
    let users = cluster.nodes()[0].partition("users");
    users.put(b"alice".to_vec(), b"1".to_vec()).await.unwrap();
    assert!(wait_for(CONVERGENCE, || cluster.converged("users")).await);

    let old_leader = cluster.leaders("users")[0].clone();
    let old_owners = cluster.owners("users");
    cluster.kill(old_leader.node()).await.unwrap();

    assert!(wait_for(CONVERGENCE, || cluster.converged("users")).await);
    let new_leader = cluster.leaders("users")[0].clone();
    assert_ne!(new_leader, old_leader);
    assert!(old_owners.contains(&new_leader.node().to_string()));
    assert!(!cluster.view_of(&new_leader).contains(&old_leader));

    let users = cluster.nodes()[0].partition("users");
    let value = wait_for_result(
        CONVERGENCE,
        || users.get(b"alice".to_vec()),
        |r| matches!(r, Ok(Some(_))),
    )
    .await;
    assert_eq!(value, Some(Ok(Some(b"1".to_vec()))));

    // The owner that replaced the dead one got the data with its join.
    for owner in cluster.owner_subnodes("users") {
        assert!(wait_for(CONVERGENCE, || has_value(&cluster, &owner, b"alice", b"1")).await);
    }
    cluster.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc3b_followers_know_every_owner_after_first_write() {
    let cluster = TestCluster::start(5).await.unwrap();
    let users = cluster.nodes()[0].partition("users");
    users.put(b"alice".to_vec(), b"1".to_vec()).await.unwrap();

    // Every owner was created with the whole owner set as its group, so
    // the followers can elect among themselves before any join runs.
    let owners = cluster.owner_subnodes("users");
    assert!(
        wait_for(Duration::from_secs(2), || owners
            .iter()
            .all(|id| cluster.view_of(id) == owners))
        .await,
        "views: {:?}",
        owners
            .iter()
            .map(|id| (id.clone(), cluster.view_of(id)))
            .collect::<Vec<_>>()
    );
    cluster.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc3c_leader_killed_right_after_first_write_recovers() {
    let mut cluster = TestCluster::start(5).await.unwrap();
    let users = cluster.nodes()[0].partition("users");
    users.put(b"alice".to_vec(), b"1".to_vec()).await.unwrap();

    let owners = cluster.owner_subnodes("users");
    assert!(
        wait_for(Duration::from_secs(2), || owners
            .iter()
            .all(|id| cluster.view_of(id) == owners))
        .await
    );
    let leaders = cluster.leaders("users");
    assert_eq!(leaders.len(), 1, "{:?}", leaders);
    cluster.kill(leaders[0].node()).await.unwrap();

    assert!(wait_for(CONVERGENCE, || cluster.converged("users")).await);
    let users = cluster.nodes()[0].partition("users");
    let value = wait_for_result(
        CONVERGENCE,
        || users.get(b"alice".to_vec()),
        |r| matches!(r, Ok(Some(_))),
    )
    .await;
    assert_eq!(value, Some(Ok(Some(b"1".to_vec()))));
    cluster.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc4_new_owner_joins_and_displaced_owner_leaves() {
    let (partition, displaced) = displaced_partition(5);
    let mut cluster = TestCluster::start(5).await.unwrap();

    let handle = cluster.nodes()[0].partition(partition.clone());
    handle.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();
    assert!(wait_for(CONVERGENCE, || cluster.converged(&partition)).await);
    let leader = cluster.leaders(&partition)[0].clone();
    assert!(cluster
        .node(&displaced)
        .and_then(|n| n.local_subnode(&partition))
        .is_some());

    let added = cluster.add_node().await.unwrap();
    assert!(cluster.owners(&partition).contains(&added.whoami()));
    assert!(!cluster.owners(&partition).contains(&displaced));

    assert!(wait_for(CONVERGENCE, || cluster.converged(&partition)).await);
    let displaced_node = cluster.node(&displaced).unwrap();
    assert!(wait_for(CONVERGENCE, || displaced_node.local_subnode(&partition).is_none()).await);

    // Leadership did not move, and the newcomer holds the data.
    assert_eq!(cluster.leaders(&partition), vec![leader]);
    let newcomer = SubnodeId::new(&added.whoami(), &partition);
    assert!(has_value(&cluster, &newcomer, b"k", b"v"));
    assert_eq!(handle.get(b"k".to_vec()).await.unwrap(), Some(b"v".to_vec()));
    cluster.stop().await.unwrap();
}

/// A partition whose owners share no node with `partition`'s owners on a
/// ring of `size` nodes.
fn disjoint_partition(size: usize, partition: &str) -> String {
    let mut ring = HashRing::new();
    for node in addresses(size) {
        ring.add_node(&node);
    }
    let taken = ring.owners(partition.as_bytes(), 3);
    for i in 0..10_000 {
        let name = format!("audit-{}", i);
        let owners = ring.owners(name.as_bytes(), 3);
        if owners.iter().all(|n| !taken.contains(n)) {
            return name;
        }
    }
    panic!("no partition disjoint from {}", partition);
}

/// Records each request body in the audit partition, keyed by the
/// partition the request was sent to.
struct AuditWriter {
    audit: String,
}

#[async_trait::async_trait]
impl RequestHandler for AuditWriter {
    async fn handle(&self, request: PartitionRequest) -> Result<Bytes> {
        let audit = request.other_partition(self.audit.clone());
        audit
            .put(request.partition().name().as_bytes().to_vec(), request.body().to_vec())
            .await?;
        Ok(Bytes::from_static(b"ok"))
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn tc5_request_handler_writes_other_partition() {
    let audit = disjoint_partition(6, "orders");
    let handler = AuditWriter {
        audit: audit.clone(),
    };
    let cluster = TestCluster::start_with_handler(6, Some(Arc::new(handler)))
        .await
        .unwrap();
    let orders_owners = cluster.owner_subnodes("orders");
    let audit_owners = cluster.owner_subnodes(&audit);
    assert!(orders_owners
        .iter()
        .all(|o| audit_owners.iter().all(|a| a.node() != o.node())));

    let node = &cluster.nodes()[5];
    let reply = node
        .request("orders", Bytes::from_static(b"order-1"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"ok"));

    let audit_handle = node.partition(audit.clone());
    assert_eq!(
        audit_handle.get(b"orders".to_vec()).await.unwrap(),
        Some(b"order-1".to_vec())
    );
    for owner in &audit_owners {
        assert!(
            wait_for(CONVERGENCE, || has_value(&cluster, owner, b"orders", b"order-1")).await,
            "{} missing the audit record",
            owner
        );
    }

    // The request ran where orders is led, and nothing landed in orders.
    let orders_leader = cluster.owners("orders")[0].clone();
    assert!(cluster
        .node(&orders_leader)
        .and_then(|n| n.local_subnode("orders"))
        .is_some());
    for owner in &orders_owners {
        let stored = cluster
            .storage(owner)
            .and_then(|s| s.get(b"orders").ok().flatten());
        assert_eq!(stored, None, "{} holds the audit record", owner);
        let misplaced = SubnodeId::new(owner.node(), &audit);
        assert!(cluster.storage(&misplaced).is_none());
    }
    cluster.stop().await.unwrap();
}
