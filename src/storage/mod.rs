//! Persistent index structures.

/// Paged B-tree used for rid-bags.
pub mod btree;
