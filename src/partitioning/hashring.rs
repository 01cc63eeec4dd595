//! Consistent hashing implementation with virtual nodes.
//!
//! Each physical node is represented by multiple virtual nodes (vnodes) so
//! that partitions spread evenly. Ownership is found by walking the ring
//! clockwise from the hash of the partition name.

use crate::types::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per physical node.
pub const DEFAULT_VNODES_PER_NODE: usize = 256;

/// A consistent hash ring of node addresses.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Hash position on the ring to owning physical node.
    vnodes: BTreeMap<u64, NodeId>,

    vnodes_per_node: usize,

    /// Physical nodes, sorted.
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Create a new empty hash ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create a new hash ring with custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            nodes: Vec::new(),
        }
    }

    /// Get the number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get all physical nodes in the ring.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Check if a node is in the ring.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n == node_id)
    }

    /// Add a node to the ring. Returns false if it was already present.
    pub fn add_node(&mut self, node_id: &str) -> bool {
        if self.contains_node(node_id) {
            return false;
        }

        self.nodes.push(node_id.to_string());
        self.nodes.sort();

        for i in 0..self.vnodes_per_node {
            let hash = Self::vnode_hash(node_id, i);
            self.vnodes.insert(hash, node_id.to_string());
        }
        true
    }

    /// Remove a node from the ring. Returns false if it was not present.
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        if !self.contains_node(node_id) {
            return false;
        }

        self.nodes.retain(|n| n != node_id);

        for i in 0..self.vnodes_per_node {
            let hash = Self::vnode_hash(node_id, i);
            // Only drop the slot if a colliding node did not overwrite it.
            if self.vnodes.get(&hash).map(|n| n == node_id).unwrap_or(false) {
                self.vnodes.remove(&hash);
            }
        }
        true
    }

    /// The node owning `key`: the first vnode clockwise from its hash.
    pub fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        self.owner_at_position(Self::hash_key(key))
    }

    /// Continue the clockwise walk from `key`, skipping every node in
    /// `exclude`. Returns None once all nodes are excluded.
    pub fn next(&self, key: &[u8], exclude: &[NodeId]) -> Option<NodeId> {
        if self.nodes.iter().all(|n| exclude.contains(n)) {
            return None;
        }

        let hash = Self::hash_key(key);
        self.vnodes
            .range(hash..)
            .chain(self.vnodes.range(..hash))
            .map(|(_, node_id)| node_id)
            .find(|node_id| !exclude.contains(node_id))
            .cloned()
    }

    /// Up to `count` distinct owners of `key` in ring order, primary first.
    pub fn owners(&self, key: &[u8], count: usize) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = Vec::with_capacity(count.min(self.nodes.len()));
        while owners.len() < count {
            match self.next(key, &owners) {
                Some(node) => owners.push(node),
                None => break,
            }
        }
        owners
    }

    /// Get the distribution of sample keys across nodes.
    pub fn distribution(&self, sample_size: usize) -> HashMap<NodeId, usize> {
        let mut distribution = HashMap::new();

        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.lookup(key.as_bytes()) {
                *distribution.entry(owner).or_insert(0) += 1;
            }
        }

        distribution
    }

    fn owner_at_position(&self, hash: u64) -> Option<NodeId> {
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, node_id)| node_id.clone())
    }

    fn vnode_hash(node_id: &str, index: usize) -> u64 {
        Self::hash_key(format!("{}:{}", node_id, index).as_bytes())
    }

    /// Calculate the hash of a key using xxHash64.
    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}
