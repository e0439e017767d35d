#![forbid(unsafe_code)]

//! Paged B-tree mapping rid-bag edge keys to link counters.

mod bucket;
/// Encoding and decoding utilities for keys and values.
pub mod codecs;
mod entry_point;
mod iter;
mod stats;
mod tree;

pub use codecs::{EdgeKey, KeyCodec, ValCodec};
pub use iter::{Direction, RangeIter};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, BTreeOptions, RidBagTree, VerifyReport};

#[cfg(test)]
mod tests;
