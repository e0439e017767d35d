use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BTreeStatsSnapshot {
    /// Root-to-leaf searches performed
    pub searches: u64,
    /// Keys inserted for the first time
    pub inserts: u64,
    /// Existing keys whose value was replaced
    pub updates: u64,
    /// Keys removed
    pub removes: u64,
    /// Leaf bucket splits (root excluded)
    pub leaf_splits: u64,
    /// Internal bucket splits (root excluded)
    pub internal_splits: u64,
    /// Root splits; each adds one level
    pub root_splits: u64,
    /// Batches read by range iterators
    pub iterator_fetches: u64,
    /// Iterator batches that had to search again from the root
    pub iterator_reseeks: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct BTreeStats {
    searches: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    iterator_fetches: AtomicU64,
    iterator_reseeks: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of root-to-leaf searches.
    pub fn searches(&self) -> u64 {
        self.searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of internal splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root splits.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of iterator re-seeks.
    pub fn iterator_reseeks(&self) -> u64 {
        self.iterator_reseeks.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inserts(&self) {
        self.inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_updates(&self) {
        self.updates.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_removes(&self) {
        self.removes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_iterator_fetches(&self) {
        self.iterator_fetches
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_iterator_reseeks(&self) {
        self.iterator_reseeks
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            searches: self.searches(),
            inserts: self.inserts.load(AtomicOrdering::Relaxed),
            updates: self.updates.load(AtomicOrdering::Relaxed),
            removes: self.removes.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            root_splits: self.root_splits(),
            iterator_fetches: self.iterator_fetches.load(AtomicOrdering::Relaxed),
            iterator_reseeks: self.iterator_reseeks(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self, tree: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "ridbag::stats",
            tree,
            searches = snapshot.searches,
            inserts = snapshot.inserts,
            updates = snapshot.updates,
            removes = snapshot.removes,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            root_splits = snapshot.root_splits,
            iterator_fetches = snapshot.iterator_fetches,
            iterator_reseeks = snapshot.iterator_reseeks,
            "btree stats snapshot"
        );
    }
}
