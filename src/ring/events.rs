//! Ring membership events.

use crate::types::NodeId;

/// A change in ring membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEvent {
    /// A node joined the ring.
    PeerUp(NodeId),

    /// A node left the ring or was declared failed.
    PeerDown(NodeId),
}

impl RingEvent {
    /// Get the node associated with this event.
    pub fn node_id(&self) -> &NodeId {
        match self {
            RingEvent::PeerUp(node_id) | RingEvent::PeerDown(node_id) => node_id,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, RingEvent::PeerUp(_))
    }

    /// Log the event.
    pub fn log(&self) {
        match self {
            RingEvent::PeerUp(node_id) => tracing::info!(peer = %node_id, "Peer up"),
            RingEvent::PeerDown(node_id) => tracing::info!(peer = %node_id, "Peer down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let up = RingEvent::PeerUp("a:1".into());
        assert_eq!(up.node_id(), "a:1");
        assert!(up.is_up());
        assert!(!RingEvent::PeerDown("a:1".into()).is_up());
    }
}
