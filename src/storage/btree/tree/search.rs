use smallvec::SmallVec;

use super::{view, BTree, SearchResult};
use crate::primitives::pager::{AtomicOperation, PageRef};
use crate::storage::btree::bucket::Bucket;
use crate::storage::btree::entry_point::ROOT_PAGE;
use crate::storage::btree::{KeyCodec, ValCodec};
use crate::types::{PageId, Result, RidbagError};

/// Leaf reached by a read-path search, still pinned.
pub(crate) struct LeafHit {
    pub(crate) page: PageRef,
    pub(crate) item: SearchResult,
}

/// Root-to-leaf path recorded for a mutation.
///
/// `indexes[i]` is where a separator promoted out of `pages[i + 1]` belongs in
/// `pages[i]`, so `indexes.len() + 1 == pages.len()`.
pub(crate) struct UpdatePath {
    pub(crate) pages: SmallVec<[PageId; 8]>,
    pub(crate) indexes: SmallVec<[usize; 8]>,
    pub(crate) item: SearchResult,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Edge {
    First,
    Last,
}

/// Child to follow from an internal bucket and the insertion index of a
/// separator promoted from it.
fn next_hop<K: KeyCodec, V: ValCodec>(
    bucket: &Bucket<&[u8], K, V>,
    found: SearchResult,
) -> Result<(PageId, usize)> {
    let size = bucket.size();
    if size == 0 {
        return Err(RidbagError::Corruption("internal bucket without entries"));
    }
    match found {
        Ok(index) => Ok((bucket.right(index)?, index + 1)),
        Err(point) if point == size => Ok((bucket.right(point - 1)?, point)),
        Err(point) => Ok((bucket.left(point)?, point)),
    }
}

/// Child `position` of an internal bucket with `size` entries, counting
/// `0..=size` from the left.
fn child_at<K: KeyCodec, V: ValCodec>(
    bucket: &Bucket<&[u8], K, V>,
    position: usize,
) -> Result<PageId> {
    if position == 0 {
        bucket.left(0)
    } else {
        bucket.right(position - 1)
    }
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    fn depth_exceeded(&self) -> RidbagError {
        RidbagError::Corruption("tree path longer than max_path_length")
    }

    /// Descends from the root to the leaf that holds or would hold `key`.
    pub(crate) fn find_bucket(
        &self,
        op: Option<&AtomicOperation>,
        key: &[u8],
    ) -> Result<LeafHit> {
        self.stats_ref().inc_searches();
        let pager = self.pager();
        let mut current = ROOT_PAGE;
        for _ in 0..self.options.max_path_length {
            let page = pager.load_page_for_read(op, self.file_id, current)?;
            let bucket = view::<K, V>(page.data());
            let found = bucket.find(key)?;
            if bucket.is_leaf() {
                return Ok(LeafHit { page, item: found });
            }
            current = next_hop(&bucket, found)?.0;
        }
        Err(self.depth_exceeded())
    }

    /// Like [`Self::find_bucket`], recording the path for splits. Reads see
    /// the uncommitted pages of `op`.
    pub(crate) fn find_bucket_for_update(
        &self,
        op: &AtomicOperation,
        key: &[u8],
    ) -> Result<UpdatePath> {
        self.stats_ref().inc_searches();
        let pager = self.pager();
        let mut pages: SmallVec<[PageId; 8]> = SmallVec::new();
        let mut indexes: SmallVec<[usize; 8]> = SmallVec::new();
        let mut current = ROOT_PAGE;
        loop {
            if pages.len() >= self.options.max_path_length {
                return Err(self.depth_exceeded());
            }
            pages.push(current);
            let page = pager.load_page_for_read(Some(op), self.file_id, current)?;
            let bucket = view::<K, V>(page.data());
            let found = bucket.find(key)?;
            if bucket.is_leaf() {
                return Ok(UpdatePath {
                    pages,
                    indexes,
                    item: found,
                });
            }
            let (child, insertion) = next_hop(&bucket, found)?;
            indexes.push(insertion);
            current = child;
        }
    }

    /// Leftmost or rightmost entry of the tree.
    ///
    /// Walks with an explicit stack of `(page, next child)` so that an empty
    /// leaf makes the walk back up and try the neighbouring subtree instead of
    /// reporting an empty tree.
    pub(crate) fn edge_item(
        &self,
        op: Option<&AtomicOperation>,
        edge: Edge,
    ) -> Result<Option<(PageRef, usize)>> {
        let pager = self.pager();
        let mut stack: Vec<(PageId, Option<usize>)> = Vec::new();
        let mut current = ROOT_PAGE;
        loop {
            if stack.len() >= self.options.max_path_length {
                return Err(self.depth_exceeded());
            }
            let page = pager.load_page_for_read(op, self.file_id, current)?;
            let bucket = view::<K, V>(page.data());
            let size = bucket.size();
            if size > 0 {
                if bucket.is_leaf() {
                    let index = match edge {
                        Edge::First => 0,
                        Edge::Last => size - 1,
                    };
                    return Ok(Some((page, index)));
                }
                let (position, next) = match edge {
                    Edge::First => (0, Some(1)),
                    Edge::Last => (size, Some(size - 1)),
                };
                let child = child_at(&bucket, position)?;
                stack.push((current, next));
                current = child;
                continue;
            }
            drop(page);

            // Empty bucket: resume from the closest ancestor with an untried child.
            loop {
                let Some((parent, next)) = stack.pop() else {
                    return Ok(None);
                };
                let Some(position) = next else {
                    continue;
                };
                let page = pager.load_page_for_read(op, self.file_id, parent)?;
                let bucket = view::<K, V>(page.data());
                if position > bucket.size() {
                    continue;
                }
                let child = child_at(&bucket, position)?;
                let following = match edge {
                    Edge::First => Some(position + 1),
                    Edge::Last => position.checked_sub(1),
                };
                stack.push((parent, following));
                current = child;
                break;
            }
        }
    }
}
