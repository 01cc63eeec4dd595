//! In-process ring shared by every node of a single process.
//!
//! All members see one [`HashRing`]. Requests are encoded with bincode on the
//! way out and decoded on the way in, and the receiving handler runs on its
//! own task, so a caller that gives up does not cancel the remote work.

use crate::error::{Error, Result};
use crate::network::rpc::{
    decode_request, decode_response, encode_request, encode_response, WireError,
};
use crate::network::{ClusterRequest, ClusterResponse, MessageHandler};
use crate::partitioning::HashRing;
use crate::ring::{Ring, RingEvent};
use crate::types::NodeId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// The shared medium the local rings live on.
#[derive(Clone)]
pub struct LocalRingNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    ring: RwLock<HashRing>,
    members: DashMap<NodeId, Arc<Member>>,
    events: broadcast::Sender<RingEvent>,
}

struct Member {
    ready: watch::Sender<bool>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    /// Requests to or from an isolated member never complete.
    isolated: AtomicBool,
}

impl Member {
    fn new(ready: bool) -> Self {
        let (ready, _) = watch::channel(ready);
        Self {
            ready,
            handler: RwLock::new(None),
            isolated: AtomicBool::new(false),
        }
    }

    async fn dispatch(&self, from: NodeId, request: ClusterRequest) -> ClusterResponse {
        let handler = if *self.ready.borrow() {
            self.handler.read().clone()
        } else {
            None
        };
        match handler {
            Some(handler) => handler.handle(from, request).await,
            None => ClusterResponse::Error(WireError::RingNotReady),
        }
    }
}

impl LocalRingNetwork {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(NetworkInner {
                ring: RwLock::new(HashRing::new()),
                members: DashMap::new(),
                events,
            }),
        }
    }

    /// Join a node that is immediately ready.
    pub fn join(&self, address: impl Into<NodeId>) -> Arc<LocalRing> {
        self.join_with_readiness(address.into(), true)
    }

    /// Join a node that answers `RingNotReady` until
    /// [`LocalRing::set_ready`] is called.
    pub fn join_pending(&self, address: impl Into<NodeId>) -> Arc<LocalRing> {
        self.join_with_readiness(address.into(), false)
    }

    fn join_with_readiness(&self, id: NodeId, ready: bool) -> Arc<LocalRing> {
        let member = Arc::new(Member::new(ready));
        self.inner.members.insert(id.clone(), member.clone());
        let added = self.inner.ring.write().add_node(&id);
        if added {
            debug!(node = %id, "Joined local ring");
            let _ = self.inner.events.send(RingEvent::PeerUp(id.clone()));
        }
        Arc::new(LocalRing {
            id,
            member,
            network: self.inner.clone(),
        })
    }

    /// Remove a node from the ring, as a failure detector would.
    pub fn remove(&self, id: &str) {
        self.inner.remove(id);
    }

    /// Cut a node off: its requests and requests to it hang until healed.
    pub fn isolate(&self, id: &str, isolated: bool) {
        if let Some(member) = self.inner.members.get(id) {
            member.isolated.store(isolated, Ordering::SeqCst);
        }
    }

    /// Nodes currently in the ring.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.ring.read().nodes().to_vec()
    }

    /// Owner set of `key` on the shared ring.
    pub fn owners(&self, key: &[u8], count: usize) -> Vec<NodeId> {
        self.inner.ring.read().owners(key, count)
    }
}

impl Default for LocalRingNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInner {
    fn remove(&self, id: &str) {
        if let Some((_, member)) = self.members.remove(id) {
            member.ready.send_replace(false);
        }
        let removed = self.ring.write().remove_node(id);
        if removed {
            debug!(node = %id, "Left local ring");
            let _ = self.events.send(RingEvent::PeerDown(id.to_string()));
        }
    }
}

/// One node's handle on a [`LocalRingNetwork`].
pub struct LocalRing {
    id: NodeId,
    member: Arc<Member>,
    network: Arc<NetworkInner>,
}

impl LocalRing {
    pub fn set_ready(&self, ready: bool) {
        self.member.ready.send_replace(ready);
    }
}

impl std::fmt::Debug for LocalRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRing").field("id", &self.id).finish()
    }
}

#[async_trait::async_trait]
impl Ring for LocalRing {
    fn whoami(&self) -> NodeId {
        self.id.clone()
    }

    fn is_ready(&self) -> bool {
        *self.member.ready.borrow()
    }

    async fn ready(&self) {
        let mut rx = self.member.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        self.network.ring.read().lookup(key)
    }

    fn next(&self, key: &[u8], exclude: &[NodeId]) -> Option<NodeId> {
        self.network.ring.read().next(key, exclude)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.network.ring.read().nodes().to_vec()
    }

    async fn send(&self, peer: &str, request: ClusterRequest) -> Result<ClusterResponse> {
        if !self.is_ready() {
            return Err(Error::RingNotReady);
        }
        let target = self
            .network
            .members
            .get(peer)
            .map(|m| m.value().clone())
            .ok_or_else(|| Error::PeerNotFound(peer.to_string()))?;

        if self.member.isolated.load(Ordering::SeqCst) || target.isolated.load(Ordering::SeqCst) {
            return futures::future::pending().await;
        }

        let bytes = encode_request(&request)?;
        let from = self.id.clone();
        let delivery = tokio::spawn(async move {
            let request = decode_request(&bytes)?;
            let response = target.dispatch(from, request).await;
            encode_response(&response)
        });
        let encoded = delivery
            .await
            .map_err(|e| Error::Internal(format!("delivery task failed: {}", e)))??;
        decode_response(&encoded)
    }

    async fn route(&self, key: &[u8], request: ClusterRequest) -> Result<ClusterResponse> {
        let target = self.lookup(key).ok_or(Error::RingNotReady)?;
        self.send(&target, request).await
    }

    fn events(&self) -> broadcast::Receiver<RingEvent> {
        self.network.events.subscribe()
    }

    fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.member.handler.write() = Some(handler);
    }

    async fn close(&self) {
        self.network.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(NodeId);

    #[async_trait::async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _from: NodeId, request: ClusterRequest) -> ClusterResponse {
            match request {
                ClusterRequest::Ping => ClusterResponse::Pong {
                    node_id: self.0.clone(),
                },
                _ => ClusterResponse::Error(WireError::Other("unsupported".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_send_and_route() {
        let network = LocalRingNetwork::new();
        let a = network.join("a:1");
        let b = network.join("b:1");
        a.set_handler(Arc::new(Echo("a:1".into())));
        b.set_handler(Arc::new(Echo("b:1".into())));

        let resp = a.send("b:1", ClusterRequest::Ping).await.unwrap();
        assert_eq!(resp, ClusterResponse::Pong { node_id: "b:1".into() });

        let owner = a.lookup(b"key").unwrap();
        let resp = b.route(b"key", ClusterRequest::Ping).await.unwrap();
        assert_eq!(resp, ClusterResponse::Pong { node_id: owner });

        assert!(matches!(
            a.send("zz:1", ClusterRequest::Ping).await,
            Err(Error::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_member_answers_not_ready() {
        let network = LocalRingNetwork::new();
        let a = network.join("a:1");
        let b = network.join_pending("b:1");
        b.set_handler(Arc::new(Echo("b:1".into())));

        let resp = a.send("b:1", ClusterRequest::Ping).await.unwrap();
        assert_eq!(resp.into_result(), Err(Error::RingNotReady));
        assert_eq!(b.send("a:1", ClusterRequest::Ping).await, Err(Error::RingNotReady));

        b.set_ready(true);
        b.ready().await;
        assert!(a.send("b:1", ClusterRequest::Ping).await.unwrap().into_result().is_ok());
    }

    #[tokio::test]
    async fn test_membership_events() {
        let network = LocalRingNetwork::new();
        let a = network.join("a:1");
        let mut events = a.events();

        let b = network.join("b:1");
        assert_eq!(events.recv().await.unwrap(), RingEvent::PeerUp("b:1".into()));
        assert_eq!(a.peers(), vec!["a:1".to_string(), "b:1".to_string()]);

        b.close().await;
        assert_eq!(events.recv().await.unwrap(), RingEvent::PeerDown("b:1".into()));
        assert_eq!(a.peers(), vec!["a:1".to_string()]);
    }
}
