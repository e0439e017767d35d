//! Page 0 of every tree file: the entry count and the page high-water mark.

use crate::primitives::bytes::field::{read_u64, write_u64};
use crate::types::{
    page::{header, PageKind},
    PageId, Result, RidbagError,
};

const TREE_SIZE_OFFSET: usize = 32;
const PAGES_SIZE_OFFSET: usize = 40;

/// Page holding the tree metadata.
pub(crate) const ENTRY_POINT_PAGE: PageId = PageId(0);
/// Page holding the root bucket; never moves.
pub(crate) const ROOT_PAGE: PageId = PageId(1);

pub(crate) struct EntryPoint<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> EntryPoint<B> {
    pub(crate) fn new(buf: B) -> Self {
        Self { buf }
    }

    /// Fails unless the page was formatted as an entry point.
    pub(crate) fn check(&self) -> Result<()> {
        if self.buf.as_ref()[header::PAGE_KIND] != PageKind::EntryPoint.as_u8() {
            return Err(RidbagError::Corruption("page 0 is not a tree entry point"));
        }
        Ok(())
    }

    /// Number of entries stored in the tree.
    pub(crate) fn tree_size(&self) -> u64 {
        read_u64(self.buf.as_ref(), TREE_SIZE_OFFSET)
    }

    /// Highest page index handed out to a bucket.
    pub(crate) fn pages_size(&self) -> u64 {
        read_u64(self.buf.as_ref(), PAGES_SIZE_OFFSET)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> EntryPoint<B> {
    pub(crate) fn init(&mut self) {
        let data = self.buf.as_mut();
        data[header::PAGE_KIND] = PageKind::EntryPoint.as_u8();
        data[TREE_SIZE_OFFSET..].fill(0);
        write_u64(data, PAGES_SIZE_OFFSET, ROOT_PAGE.0);
    }

    pub(crate) fn set_tree_size(&mut self, size: u64) {
        write_u64(self.buf.as_mut(), TREE_SIZE_OFFSET, size);
    }

    pub(crate) fn set_pages_size(&mut self, pages: u64) {
        write_u64(self.buf.as_mut(), PAGES_SIZE_OFFSET, pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_point_counts_root() -> Result<()> {
        let mut page = vec![0u8; 256];
        let mut entry = EntryPoint::new(&mut page[..]);
        assert!(entry.check().is_err());
        entry.init();
        entry.check()?;
        assert_eq!(entry.tree_size(), 0);
        assert_eq!(entry.pages_size(), 1);
        entry.set_tree_size(12);
        entry.set_pages_size(4);
        assert_eq!(entry.tree_size(), 12);
        assert_eq!(entry.pages_size(), 4);
        Ok(())
    }
}
