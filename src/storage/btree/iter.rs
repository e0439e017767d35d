//! Lazy range scans over the leaf chain.
//!
//! Entries are read in batches. Each batch takes the tree's read locks, copies
//! up to `iterator_batch_size` entries, remembers where it stopped together
//! with that page's LSN, and releases every lock before returning. The next
//! batch continues from the remembered slot when the page is unchanged, and
//! otherwise searches again from the root for the last key it returned.

use std::collections::VecDeque;

use super::tree::search::Edge;
use super::tree::{view, BTree};
use super::{KeyCodec, ValCodec};
use crate::primitives::pager::PageRef;
use crate::types::{Lsn, PageId, Result};

/// Scan order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Ascending keys, following right siblings.
    Forward,
    /// Descending keys, following left siblings.
    Backward,
}

/// One end of a scanned range.
#[derive(Clone, Debug)]
pub(crate) struct ScanBound {
    key: Vec<u8>,
    inclusive: bool,
}

impl ScanBound {
    pub(crate) fn new(key: Vec<u8>, inclusive: bool) -> Self {
        Self { key, inclusive }
    }
}

/// Where the previous batch stopped.
///
/// Forward scans read slot `cursor` next; backward scans read `cursor - 1`.
struct Position {
    page: PageId,
    cursor: usize,
    lsn: Lsn,
}

/// Iterator over `(key, value)` pairs of a key range.
pub struct RangeIter<'a, K: KeyCodec, V: ValCodec> {
    tree: &'a BTree<K, V>,
    from: Option<ScanBound>,
    to: Option<ScanBound>,
    direction: Direction,
    cache: VecDeque<(K, V)>,
    last_key: Option<Vec<u8>>,
    position: Option<Position>,
    exhausted: bool,
}

impl<'a, K: KeyCodec, V: ValCodec> RangeIter<'a, K, V> {
    pub(crate) fn new(
        tree: &'a BTree<K, V>,
        from: Option<ScanBound>,
        to: Option<ScanBound>,
        direction: Direction,
    ) -> Self {
        let empty = match (&from, &to) {
            (Some(from), Some(to)) => {
                let order = K::compare_encoded(&from.key, &to.key);
                order.is_gt() || (order.is_eq() && !(from.inclusive && to.inclusive))
            }
            _ => false,
        };
        Self {
            tree,
            from,
            to,
            direction,
            cache: VecDeque::new(),
            last_key: None,
            position: None,
            exhausted: empty,
        }
    }

    /// Scan order of this iterator.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn fetch_next_portion(&mut self) -> Result<()> {
        let tree = self.tree;
        tree.read_locked(None, || {
            tree.stats_ref().inc_iterator_fetches();
            let Some((page, cursor)) = self.resume_point()? else {
                self.exhausted = true;
                return Ok(());
            };
            match self.direction {
                Direction::Forward => self.read_forward(page, cursor),
                Direction::Backward => self.read_backward(page, cursor),
            }
        })
    }

    /// Page and cursor to continue from: the remembered slot when its page is
    /// unchanged, otherwise a fresh search.
    fn resume_point(&mut self) -> Result<Option<(PageRef, usize)>> {
        if let Some(position) = self.position.take() {
            let page = self
                .tree
                .pager()
                .load_page_for_read(None, self.tree.file_id(), position.page)?;
            if view::<K, V>(page.data()).lsn() == position.lsn {
                return Ok(Some((page, position.cursor)));
            }
            self.tree.stats_ref().inc_iterator_reseeks();
        }
        self.seek()
    }

    fn seek(&self) -> Result<Option<(PageRef, usize)>> {
        let tree = self.tree;
        match self.direction {
            Direction::Forward => {
                if let Some(last) = &self.last_key {
                    let hit = tree.find_bucket(None, last)?;
                    let cursor = match hit.item {
                        Ok(index) => index + 1,
                        Err(point) => point,
                    };
                    Ok(Some((hit.page, cursor)))
                } else if let Some(from) = &self.from {
                    let hit = tree.find_bucket(None, &from.key)?;
                    let cursor = match hit.item {
                        Ok(index) if from.inclusive => index,
                        Ok(index) => index + 1,
                        Err(point) => point,
                    };
                    Ok(Some((hit.page, cursor)))
                } else {
                    Ok(tree.edge_item(None, Edge::First)?)
                }
            }
            Direction::Backward => {
                if let Some(last) = &self.last_key {
                    let hit = tree.find_bucket(None, last)?;
                    let cursor = match hit.item {
                        Ok(index) => index,
                        Err(point) => point,
                    };
                    Ok(Some((hit.page, cursor)))
                } else if let Some(to) = &self.to {
                    let hit = tree.find_bucket(None, &to.key)?;
                    let cursor = match hit.item {
                        Ok(index) if to.inclusive => index + 1,
                        Ok(index) => index,
                        Err(point) => point,
                    };
                    Ok(Some((hit.page, cursor)))
                } else {
                    Ok(tree
                        .edge_item(None, Edge::Last)?
                        .map(|(page, index)| (page, index + 1)))
                }
            }
        }
    }

    fn remember(&mut self, page: &PageRef, cursor: usize) {
        self.position = Some(Position {
            page: page.id,
            cursor,
            lsn: view::<K, V>(page.data()).lsn(),
        });
    }

    fn read_forward(&mut self, mut page: PageRef, mut cursor: usize) -> Result<()> {
        let batch = self.tree.options().iterator_batch_size;
        loop {
            if self.cache.len() >= batch {
                self.remember(&page, cursor);
                return Ok(());
            }
            let bucket = view::<K, V>(page.data());
            if cursor >= bucket.size() {
                match bucket.right_sibling() {
                    Some(next) => {
                        page = self
                            .tree
                            .pager()
                            .load_page_for_read(None, self.tree.file_id(), next)?;
                        cursor = 0;
                        continue;
                    }
                    None => {
                        self.exhausted = true;
                        return Ok(());
                    }
                }
            }
            let key = bucket.key_bytes(cursor)?;
            if let Some(to) = &self.to {
                let order = K::compare_encoded(key, &to.key);
                if order.is_gt() || (order.is_eq() && !to.inclusive) {
                    self.exhausted = true;
                    return Ok(());
                }
            }
            let entry = (K::decode_key(key)?, bucket.value(cursor)?);
            self.last_key = Some(key.to_vec());
            self.cache.push_back(entry);
            cursor += 1;
        }
    }

    fn read_backward(&mut self, mut page: PageRef, mut cursor: usize) -> Result<()> {
        let batch = self.tree.options().iterator_batch_size;
        loop {
            if self.cache.len() >= batch {
                self.remember(&page, cursor);
                return Ok(());
            }
            let bucket = view::<K, V>(page.data());
            if cursor == 0 {
                match bucket.left_sibling() {
                    Some(previous) => {
                        page = self
                            .tree
                            .pager()
                            .load_page_for_read(None, self.tree.file_id(), previous)?;
                        cursor = view::<K, V>(page.data()).size();
                        continue;
                    }
                    None => {
                        self.exhausted = true;
                        return Ok(());
                    }
                }
            }
            let index = cursor - 1;
            let key = bucket.key_bytes(index)?;
            if let Some(from) = &self.from {
                let order = K::compare_encoded(key, &from.key);
                if order.is_lt() || (order.is_eq() && !from.inclusive) {
                    self.exhausted = true;
                    return Ok(());
                }
            }
            let entry = (K::decode_key(key)?, bucket.value(index)?);
            self.last_key = Some(key.to_vec());
            self.cache.push_back(entry);
            cursor = index;
        }
    }
}

impl<K: KeyCodec, V: ValCodec> Iterator for RangeIter<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.cache.pop_front() {
            return Some(Ok(entry));
        }
        if self.exhausted {
            return None;
        }
        if let Err(err) = self.fetch_next_portion() {
            self.exhausted = true;
            return Some(Err(err.in_component(self.tree.name(), "iterate")));
        }
        self.cache.pop_front().map(Ok)
    }
}
