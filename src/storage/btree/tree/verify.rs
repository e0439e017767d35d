use serde::Serialize;

use super::{view, BTree};
use crate::storage::btree::entry_point::{EntryPoint, ENTRY_POINT_PAGE, ROOT_PAGE};
use crate::storage::btree::{KeyCodec, ValCodec};
use crate::types::{PageId, Result};

/// Findings of a full structural walk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Entries found in leaves.
    pub entries: u64,
    /// Entry count recorded on the entry point.
    pub recorded_size: u64,
    /// Leaf buckets reached from the root.
    pub leaves: u64,
    /// Internal buckets reached from the root.
    pub internal_buckets: u64,
    /// Levels from the root to the leaves.
    pub depth: usize,
    /// Human-readable description of every violation.
    pub errors: Vec<String>,
}

impl VerifyReport {
    /// True when no violation was found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Walk {
    report: VerifyReport,
    leaf_order: Vec<PageId>,
    leaf_depth: Option<usize>,
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    /// Walks the whole tree checking key order, separator bounds, the leaf
    /// sibling chain, and the recorded size.
    pub fn verify(&self) -> Result<VerifyReport> {
        self.read_locked(None, || self.verify_locked())
            .map_err(|err| err.in_component(&self.name, "verify"))
    }

    fn verify_locked(&self) -> Result<VerifyReport> {
        let mut walk = Walk {
            report: VerifyReport::default(),
            leaf_order: Vec::new(),
            leaf_depth: None,
        };
        {
            let page = self
                .pager()
                .load_page_for_read(None, self.file_id, ENTRY_POINT_PAGE)?;
            walk.report.recorded_size = EntryPoint::new(page.data()).tree_size();
        }
        self.verify_subtree(&mut walk, ROOT_PAGE, None, None, 1)?;
        self.verify_sibling_chain(&mut walk)?;
        let mut report = walk.report;
        report.depth = walk.leaf_depth.unwrap_or(1);
        if report.entries != report.recorded_size {
            report.errors.push(format!(
                "entry point records {} entries, leaves hold {}",
                report.recorded_size, report.entries
            ));
        }
        Ok(report)
    }

    fn verify_subtree(
        &self,
        walk: &mut Walk,
        page_id: PageId,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        depth: usize,
    ) -> Result<()> {
        if depth > self.options.max_path_length {
            walk.report
                .errors
                .push(format!("page {page_id}: deeper than max_path_length"));
            return Ok(());
        }
        let page = self
            .pager()
            .load_page_for_read(None, self.file_id, page_id)?;
        let bucket = view::<K, V>(page.data());
        let size = bucket.size();
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(size);
        for index in 0..size {
            keys.push(bucket.key_bytes(index)?.to_vec());
        }
        for pair in keys.windows(2) {
            if K::compare_encoded(&pair[0], &pair[1]).is_ge() {
                walk.report
                    .errors
                    .push(format!("page {page_id}: keys out of order"));
                break;
            }
        }
        let below_low = |key: &[u8]| low.is_some_and(|low| K::compare_encoded(key, low).is_lt());
        let above_high = |key: &[u8]| high.is_some_and(|high| K::compare_encoded(key, high).is_ge());
        if keys.iter().any(|key| below_low(key) || above_high(key)) {
            walk.report
                .errors
                .push(format!("page {page_id}: key outside separator bounds"));
        }

        if bucket.is_leaf() {
            walk.report.leaves += 1;
            walk.report.entries += size as u64;
            walk.leaf_order.push(page_id);
            match walk.leaf_depth {
                None => walk.leaf_depth = Some(depth),
                Some(expected) if expected != depth => walk.report.errors.push(format!(
                    "page {page_id}: leaf at depth {depth}, expected {expected}"
                )),
                Some(_) => {}
            }
            return Ok(());
        }

        walk.report.internal_buckets += 1;
        if size == 0 {
            walk.report
                .errors
                .push(format!("page {page_id}: internal bucket without entries"));
            return Ok(());
        }
        let mut children = Vec::with_capacity(size + 1);
        children.push(bucket.left(0)?);
        for index in 0..size {
            let right = bucket.right(index)?;
            if index + 1 < size && bucket.left(index + 1)? != right {
                walk.report.errors.push(format!(
                    "page {page_id}: entries {index} and {} disagree on their shared child",
                    index + 1
                ));
            }
            children.push(right);
        }
        drop(page);
        for (position, child) in children.into_iter().enumerate() {
            let child_low = if position == 0 {
                low
            } else {
                Some(keys[position - 1].as_slice())
            };
            let child_high = if position == size {
                high
            } else {
                Some(keys[position].as_slice())
            };
            self.verify_subtree(walk, child, child_low, child_high, depth + 1)?;
        }
        Ok(())
    }

    fn verify_sibling_chain(&self, walk: &mut Walk) -> Result<()> {
        let pager = self.pager();
        let mut previous: Option<PageId> = None;
        for (position, &leaf) in walk.leaf_order.iter().enumerate() {
            let page = pager.load_page_for_read(None, self.file_id, leaf)?;
            let bucket = view::<K, V>(page.data());
            if bucket.left_sibling() != previous {
                walk.report
                    .errors
                    .push(format!("leaf {leaf}: left sibling does not match scan order"));
            }
            let expected_right = walk.leaf_order.get(position + 1).copied();
            if bucket.right_sibling() != expected_right {
                walk.report
                    .errors
                    .push(format!("leaf {leaf}: right sibling does not match scan order"));
            }
            previous = Some(leaf);
        }
        Ok(())
    }
}
