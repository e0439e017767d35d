#![forbid(unsafe_code)]
//! Page cache, WAL-backed atomic operations, and the data file registry.

mod atomic;
mod frame;
mod manifest;
mod pager;

pub use atomic::{AtomicOperation, AtomicOperationsManager};
pub use manifest::{Manifest, ManifestFile};
pub use pager::{
    PageKey, PageMut, PageRef, Pager, PagerOptions, PagerStats, Synchronous,
};
