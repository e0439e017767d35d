//! Durable on-disk B-tree for graph edge rid-bags.
//!
//! A [`storage::btree::RidBagTree`] maps edge keys (owning bag, target cluster,
//! target position) to link counters. Trees live in files managed by a
//! [`primitives::pager::Pager`], and every mutation runs inside an atomic
//! operation that becomes durable through the write-ahead log on commit.

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;
