//! Partition placement over a consistent hash ring.
//!
//! A partition name hashes to a position on the ring. Walking clockwise from
//! that position yields its owner set: the first node is the partition
//! leader, the next `redundancy` distinct nodes are its replicas.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         HashRing                            │
//! │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐            │
//! │  │VN:a │→│VN:b │→│VN:c │→│VN:a │→│VN:d │→│VN:b │→ ...       │
//! │  └─────┘ └─────┘ └─────┘ └─────┘ └─────┘ └─────┘            │
//! │      256 virtual nodes per physical node                    │
//! │                                                             │
//! │  "users" → hash → lookup  → a  (leader)                     │
//! │                 → next(a) → b  (replica)                    │
//! │                 → next(a,b) → c (replica)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod hashring;

pub use hashring::{HashRing, DEFAULT_VNODES_PER_NODE};
