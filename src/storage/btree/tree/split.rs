use smallvec::SmallVec;
use tracing::debug;

use super::{view, BTree};
use crate::primitives::pager::AtomicOperation;
use crate::storage::btree::bucket::Bucket;
use crate::storage::btree::entry_point::ROOT_PAGE;
use crate::storage::btree::{KeyCodec, ValCodec};
use crate::types::{PageId, Result, RidbagError};

/// Where an insertion lands after its bucket split.
pub(crate) struct SplitPath {
    pub(crate) pages: SmallVec<[PageId; 8]>,
    pub(crate) indexes: SmallVec<[usize; 8]>,
    pub(crate) item_index: usize,
}

/// Entries of a full bucket, cut at the midpoint.
struct Halves {
    leaf: bool,
    mid: usize,
    separator: Vec<u8>,
    left: Vec<Vec<u8>>,
    right: Vec<Vec<u8>>,
    right_sibling: Option<PageId>,
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    fn read_halves(&self, op: &AtomicOperation, page_id: PageId) -> Result<Halves> {
        let page = self
            .pager()
            .load_page_for_read(Some(op), self.file_id, page_id)?;
        let bucket = view::<K, V>(page.data());
        let size = bucket.size();
        if size < 2 {
            return Err(RidbagError::Corruption("split of a bucket with fewer than two entries"));
        }
        let leaf = bucket.is_leaf();
        let mid = size >> 1;
        // Leaves keep the separator entry on the right; internal buckets
        // promote it.
        let right_start = if leaf { mid } else { mid + 1 };
        let raw = |range: std::ops::Range<usize>| {
            range
                .map(|index| bucket.raw_entry(index).map(<[u8]>::to_vec))
                .collect::<Result<Vec<_>>>()
        };
        Ok(Halves {
            leaf,
            mid,
            separator: bucket.key_bytes(mid)?.to_vec(),
            left: raw(0..mid)?,
            right: raw(right_start..size)?,
            right_sibling: bucket.right_sibling(),
        })
    }

    /// Position of insertion index `key_index` after the split: `(true, i)`
    /// for the left half, `(false, i)` for the right.
    fn remap(halves: &Halves, key_index: usize) -> (bool, usize) {
        if key_index <= halves.mid {
            (true, key_index)
        } else if halves.leaf {
            (false, key_index - halves.mid)
        } else {
            (false, key_index - halves.mid - 1)
        }
    }

    /// Splits the last bucket of `pages`, promoting the middle key into its
    /// parent (splitting ancestors as needed), and returns the path to the
    /// bucket that should now receive the entry at `key_index`. `depth` is
    /// the current root-to-leaf length of the tree.
    pub(crate) fn split_bucket(
        &self,
        op: &AtomicOperation,
        pages: &[PageId],
        indexes: &[usize],
        key_index: usize,
        depth: usize,
    ) -> Result<SplitPath> {
        let page_id = *pages
            .last()
            .ok_or(RidbagError::Corruption("split with empty path"))?;
        if pages.len() == 1 {
            if page_id != ROOT_PAGE {
                return Err(RidbagError::Corruption("split path does not start at root"));
            }
            return self.split_root(op, key_index, depth);
        }
        if indexes.len() + 1 != pages.len() {
            return Err(RidbagError::Corruption("split path and indexes disagree"));
        }
        self.split_non_root(op, pages, indexes, key_index, depth)
    }

    fn split_non_root(
        &self,
        op: &AtomicOperation,
        pages: &[PageId],
        indexes: &[usize],
        key_index: usize,
        depth: usize,
    ) -> Result<SplitPath> {
        let pager = self.pager();
        let page_id = pages[pages.len() - 1];
        let halves = self.read_halves(op, page_id)?;

        let mut right_page = self.allocate_page(op)?;
        let right_id = right_page.id;
        {
            let mut right = Bucket::<_, K, V>::new(right_page.data_mut());
            right.init(halves.leaf)?;
            right.add_all(&halves.right)?;
            if halves.leaf {
                right.set_left_sibling(Some(page_id));
                right.set_right_sibling(halves.right_sibling);
            }
        }
        drop(right_page);
        {
            let mut page = pager.load_page_for_write(op, self.file_id, page_id)?;
            let mut left = Bucket::<_, K, V>::new(page.data_mut());
            left.shrink(halves.mid)?;
            if halves.leaf {
                left.set_right_sibling(Some(right_id));
            }
        }
        if halves.leaf {
            if let Some(next) = halves.right_sibling {
                let mut page = pager.load_page_for_write(op, self.file_id, next)?;
                Bucket::<_, K, V>::new(page.data_mut()).set_left_sibling(Some(right_id));
            }
            self.stats_ref().inc_leaf_splits();
        } else {
            self.stats_ref().inc_internal_splits();
        }
        debug!(
            tree = %self.name,
            page = page_id.0,
            new_page = right_id.0,
            leaf = halves.leaf,
            "btree.split"
        );

        let parent_level = pages.len() - 2;
        let mut parent_pages: SmallVec<[PageId; 8]> = SmallVec::from_slice(&pages[..=parent_level]);
        let mut parent_indexes: SmallVec<[usize; 8]> =
            SmallVec::from_slice(&indexes[..parent_level]);
        let mut insertion = indexes[parent_level];
        loop {
            let parent_id = parent_pages[parent_pages.len() - 1];
            let added = {
                let mut page = pager.load_page_for_write(op, self.file_id, parent_id)?;
                Bucket::<_, K, V>::new(page.data_mut()).add_non_leaf_entry(
                    insertion,
                    page_id,
                    right_id,
                    &halves.separator,
                    true,
                )?
            };
            if added {
                break;
            }
            let split = self.split_bucket(op, &parent_pages, &parent_indexes, insertion, depth)?;
            parent_pages = split.pages;
            parent_indexes = split.indexes;
            insertion = split.item_index;
        }

        let (to_left, item_index) = Self::remap(&halves, key_index);
        let mut path_pages = parent_pages;
        let mut path_indexes = parent_indexes;
        if to_left {
            path_pages.push(page_id);
            path_indexes.push(insertion);
        } else {
            path_pages.push(right_id);
            path_indexes.push(insertion + 1);
        }
        Ok(SplitPath {
            pages: path_pages,
            indexes: path_indexes,
            item_index,
        })
    }

    /// Moves both halves of the root into new pages and leaves the root as an
    /// internal bucket with a single separator. The only way the tree grows
    /// taller, so it is refused once the tree is `max_path_length` deep.
    fn split_root(
        &self,
        op: &AtomicOperation,
        key_index: usize,
        depth: usize,
    ) -> Result<SplitPath> {
        if depth >= self.options.max_path_length {
            return Err(RidbagError::Invalid("root split would exceed max_path_length"));
        }
        let pager = self.pager();
        let halves = self.read_halves(op, ROOT_PAGE)?;
        let mut left_page = self.allocate_page(op)?;
        let mut right_page = self.allocate_page(op)?;
        let (left_id, right_id) = (left_page.id, right_page.id);
        {
            let mut left = Bucket::<_, K, V>::new(left_page.data_mut());
            left.init(halves.leaf)?;
            left.add_all(&halves.left)?;
            if halves.leaf {
                left.set_right_sibling(Some(right_id));
            }
        }
        {
            let mut right = Bucket::<_, K, V>::new(right_page.data_mut());
            right.init(halves.leaf)?;
            right.add_all(&halves.right)?;
            if halves.leaf {
                right.set_left_sibling(Some(left_id));
            }
        }
        drop(left_page);
        drop(right_page);
        {
            let mut page = pager.load_page_for_write(op, self.file_id, ROOT_PAGE)?;
            let mut root = Bucket::<_, K, V>::new(page.data_mut());
            root.shrink(0)?;
            if halves.leaf {
                root.switch_bucket_type()?;
            }
            if !root.add_non_leaf_entry(0, left_id, right_id, &halves.separator, false)? {
                return Err(RidbagError::Corruption("separator does not fit an empty root"));
            }
        }
        self.stats_ref().inc_root_splits();
        debug!(
            tree = %self.name,
            left = left_id.0,
            right = right_id.0,
            leaf = halves.leaf,
            "btree.split_root"
        );

        let (to_left, item_index) = Self::remap(&halves, key_index);
        let mut pages: SmallVec<[PageId; 8]> = SmallVec::new();
        let mut indexes: SmallVec<[usize; 8]> = SmallVec::new();
        pages.push(ROOT_PAGE);
        if to_left {
            pages.push(left_id);
            indexes.push(0);
        } else {
            pages.push(right_id);
            indexes.push(1);
        }
        Ok(SplitPath {
            pages,
            indexes,
            item_index,
        })
    }
}
