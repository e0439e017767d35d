//! In-page layout of tree nodes ("buckets").
//!
//! ```text
//! 0..32    common page header
//! 32       flags (bit 0 = leaf)
//! 34..36   entry count
//! 36..40   free pointer (entries occupy [free pointer, page end))
//! 40..48   left sibling (leaves, 0 = none)
//! 48..56   right sibling (leaves, 0 = none)
//! 56..     u16 slot per entry holding its offset, in key order
//! ```
//!
//! Leaf entries are `key ‖ value`; internal entries are
//! `left child u64 ‖ right child u64 ‖ key`. Entries are written from the end
//! of the page downwards; the slot directory grows upwards towards them.

use std::marker::PhantomData;

use crate::primitives::bytes::field::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::storage::btree::{KeyCodec, ValCodec};
use crate::types::{
    page::{self, PageKind},
    Lsn, PageId, Result, RidbagError,
};

const FLAGS_OFFSET: usize = 32;
const SIZE_OFFSET: usize = 34;
const FREE_POINTER_OFFSET: usize = 36;
const LEFT_SIBLING_OFFSET: usize = 40;
const RIGHT_SIBLING_OFFSET: usize = 48;
/// First byte of the slot directory.
pub(crate) const POSITIONS_OFFSET: usize = 56;

const LEAF_FLAG: u8 = 1;
const SLOT_LEN: usize = 2;
const CHILD_POINTERS_LEN: usize = 16;

/// Bytes available for slots and entries in a bucket of `page_size` bytes.
pub(crate) fn capacity(page_size: usize) -> usize {
    page_size - POSITIONS_OFFSET
}

/// Typed view of a bucket page. `B` is `&[u8]` for reads and `&mut [u8]` for
/// edits.
pub(crate) struct Bucket<B, K, V> {
    buf: B,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<B: AsRef<[u8]>, K: KeyCodec, V: ValCodec> Bucket<B, K, V> {
    pub(crate) fn new(buf: B) -> Self {
        Self {
            buf,
            _marker: PhantomData,
        }
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.data()[FLAGS_OFFSET] & LEAF_FLAG != 0
    }

    pub(crate) fn size(&self) -> usize {
        usize::from(read_u16(self.data(), SIZE_OFFSET))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn free_pointer(&self) -> usize {
        read_u32(self.data(), FREE_POINTER_OFFSET) as usize
    }

    /// Bytes left between the slot directory and the lowest entry.
    pub(crate) fn free_space(&self) -> usize {
        let slots_end = POSITIONS_OFFSET + SLOT_LEN * self.size();
        self.free_pointer().saturating_sub(slots_end)
    }

    /// LSN stamped by the commit that last wrote this page.
    pub(crate) fn lsn(&self) -> Lsn {
        page::lsn(self.data())
    }

    pub(crate) fn left_sibling(&self) -> Option<PageId> {
        decode_page_id(read_u64(self.data(), LEFT_SIBLING_OFFSET))
    }

    pub(crate) fn right_sibling(&self) -> Option<PageId> {
        decode_page_id(read_u64(self.data(), RIGHT_SIBLING_OFFSET))
    }

    fn entry_offset(&self, index: usize) -> Result<usize> {
        if index >= self.size() {
            return Err(RidbagError::Corruption("bucket entry index out of range"));
        }
        let offset = usize::from(read_u16(self.data(), POSITIONS_OFFSET + SLOT_LEN * index));
        if offset < self.free_pointer() || offset >= self.data().len() {
            return Err(RidbagError::Corruption("bucket entry offset out of range"));
        }
        Ok(offset)
    }

    fn key_start(&self, offset: usize) -> usize {
        if self.is_leaf() {
            offset
        } else {
            offset + CHILD_POINTERS_LEN
        }
    }

    /// Total length of the entry stored at `offset`.
    fn entry_len_at(&self, offset: usize) -> Result<usize> {
        let data = self.data();
        let key_start = self.key_start(offset);
        if key_start > data.len() {
            return Err(RidbagError::Corruption("bucket entry truncated"));
        }
        let key_len = K::encoded_len(&data[key_start..])?;
        if self.is_leaf() {
            let value_len = V::encoded_len(&data[key_start + key_len..])?;
            Ok(key_len + value_len)
        } else {
            Ok(CHILD_POINTERS_LEN + key_len)
        }
    }

    pub(crate) fn key_bytes(&self, index: usize) -> Result<&[u8]> {
        let offset = self.entry_offset(index)?;
        let start = self.key_start(offset);
        let len = K::encoded_len(&self.data()[start..])?;
        Ok(&self.data()[start..start + len])
    }

    pub(crate) fn key(&self, index: usize) -> Result<K> {
        K::decode_key(self.key_bytes(index)?)
    }

    pub(crate) fn value_bytes(&self, index: usize) -> Result<&[u8]> {
        if !self.is_leaf() {
            return Err(RidbagError::Corruption("value read from internal bucket"));
        }
        let offset = self.entry_offset(index)?;
        let start = offset + K::encoded_len(&self.data()[offset..])?;
        let len = V::encoded_len(&self.data()[start..])?;
        Ok(&self.data()[start..start + len])
    }

    pub(crate) fn value(&self, index: usize) -> Result<V> {
        V::decode_val(self.value_bytes(index)?)
    }

    fn child(&self, index: usize, at: usize) -> Result<PageId> {
        if self.is_leaf() {
            return Err(RidbagError::Corruption("child read from leaf bucket"));
        }
        let offset = self.entry_offset(index)?;
        decode_page_id(read_u64(self.data(), offset + at))
            .ok_or(RidbagError::Corruption("internal entry without child"))
    }

    pub(crate) fn left(&self, index: usize) -> Result<PageId> {
        self.child(index, 0)
    }

    pub(crate) fn right(&self, index: usize) -> Result<PageId> {
        self.child(index, 8)
    }

    /// Undecoded bytes of entry `index`, children included.
    pub(crate) fn raw_entry(&self, index: usize) -> Result<&[u8]> {
        let offset = self.entry_offset(index)?;
        let len = self.entry_len_at(offset)?;
        Ok(&self.data()[offset..offset + len])
    }

    /// Binary search by encoded key: `Ok(index)` on a match, otherwise
    /// `Err(insertion point)`.
    pub(crate) fn find(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = self.size();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match K::compare_encoded(self.key_bytes(mid)?, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>, K: KeyCodec, V: ValCodec> Bucket<B, K, V> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Resets the page to an empty bucket.
    pub(crate) fn init(&mut self, leaf: bool) -> Result<()> {
        let page_size = self.data().len();
        let free_pointer = u32::try_from(page_size)
            .map_err(|_| RidbagError::Invalid("page size exceeds bucket addressing"))?;
        let data = self.data_mut();
        data[page::header::PAGE_KIND] = PageKind::Bucket.as_u8();
        data[FLAGS_OFFSET..].fill(0);
        data[FLAGS_OFFSET] = if leaf { LEAF_FLAG } else { 0 };
        write_u32(data, FREE_POINTER_OFFSET, free_pointer);
        Ok(())
    }

    fn set_size(&mut self, size: usize) -> Result<()> {
        let size = u16::try_from(size).map_err(|_| RidbagError::Corruption("bucket too large"))?;
        write_u16(self.data_mut(), SIZE_OFFSET, size);
        Ok(())
    }

    fn set_free_pointer(&mut self, free_pointer: usize) {
        write_u32(self.data_mut(), FREE_POINTER_OFFSET, free_pointer as u32);
    }

    fn set_slot(&mut self, index: usize, offset: usize) {
        write_u16(self.data_mut(), POSITIONS_OFFSET + SLOT_LEN * index, offset as u16);
    }

    pub(crate) fn set_left_sibling(&mut self, sibling: Option<PageId>) {
        write_u64(self.data_mut(), LEFT_SIBLING_OFFSET, encode_page_id(sibling));
    }

    pub(crate) fn set_right_sibling(&mut self, sibling: Option<PageId>) {
        write_u64(self.data_mut(), RIGHT_SIBLING_OFFSET, encode_page_id(sibling));
    }

    /// Writes `parts` as one entry and opens slot `index` for it. Returns
    /// false when the page lacks room.
    fn insert_entry(&mut self, index: usize, parts: &[&[u8]]) -> Result<bool> {
        let size = self.size();
        if index > size {
            return Err(RidbagError::Corruption("bucket insert index out of range"));
        }
        let len: usize = parts.iter().map(|part| part.len()).sum();
        if self.free_space() < len + SLOT_LEN {
            return Ok(false);
        }
        let offset = self.free_pointer() - len;
        let data = self.data_mut();
        let mut at = offset;
        for part in parts {
            data[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        let slot = POSITIONS_OFFSET + SLOT_LEN * index;
        let slots_end = POSITIONS_OFFSET + SLOT_LEN * size;
        data.copy_within(slot..slots_end, slot + SLOT_LEN);
        self.set_free_pointer(offset);
        self.set_slot(index, offset);
        self.set_size(size + 1)?;
        Ok(true)
    }

    pub(crate) fn add_leaf_entry(&mut self, index: usize, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.is_leaf() {
            return Err(RidbagError::Corruption("leaf entry added to internal bucket"));
        }
        self.insert_entry(index, &[key, value])
    }

    /// Inserts a separator with its two children. With `update_neighbors`,
    /// the adjacent entries are repointed so that neighbouring entries keep
    /// sharing their common child.
    pub(crate) fn add_non_leaf_entry(
        &mut self,
        index: usize,
        left: PageId,
        right: PageId,
        key: &[u8],
        update_neighbors: bool,
    ) -> Result<bool> {
        if self.is_leaf() {
            return Err(RidbagError::Corruption("internal entry added to leaf bucket"));
        }
        let left_bytes = left.0.to_be_bytes();
        let right_bytes = right.0.to_be_bytes();
        if !self.insert_entry(index, &[&left_bytes[..], &right_bytes[..], key])? {
            return Ok(false);
        }
        if update_neighbors {
            if index + 1 < self.size() {
                self.set_left(index + 1, right)?;
            }
            if index > 0 {
                self.set_right(index - 1, left)?;
            }
        }
        Ok(true)
    }

    fn set_child(&mut self, index: usize, at: usize, child: u64) -> Result<()> {
        let offset = self.entry_offset(index)?;
        write_u64(self.data_mut(), offset + at, child);
        Ok(())
    }

    pub(crate) fn set_left(&mut self, index: usize, child: PageId) -> Result<()> {
        self.set_child(index, 0, child.0)
    }

    pub(crate) fn set_right(&mut self, index: usize, child: PageId) -> Result<()> {
        self.set_child(index, 8, child.0)
    }

    /// Removes leaf entry `index` and compacts the entry area.
    pub(crate) fn remove_leaf_entry(&mut self, index: usize) -> Result<()> {
        if !self.is_leaf() {
            return Err(RidbagError::Corruption("leaf removal on internal bucket"));
        }
        let size = self.size();
        let offset = self.entry_offset(index)?;
        let len = self.entry_len_at(offset)?;
        let free_pointer = self.free_pointer();
        let data = self.data_mut();
        data.copy_within(free_pointer..offset, free_pointer + len);
        let slot = POSITIONS_OFFSET + SLOT_LEN * index;
        let slots_end = POSITIONS_OFFSET + SLOT_LEN * size;
        data.copy_within(slot + SLOT_LEN..slots_end, slot);
        for i in 0..size - 1 {
            let at = POSITIONS_OFFSET + SLOT_LEN * i;
            let entry = usize::from(read_u16(data, at));
            if entry < offset {
                write_u16(data, at, (entry + len) as u16);
            }
        }
        self.set_free_pointer(free_pointer + len);
        self.set_size(size - 1)
    }

    /// Overwrites the value of leaf entry `index`; the encoded length must
    /// not change.
    pub(crate) fn update_value(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let current = self.value_bytes(index)?.len();
        if current != value.len() {
            return Err(RidbagError::Invalid("in-place update needs equal value length"));
        }
        let offset = self.entry_offset(index)?;
        let start = offset + K::encoded_len(&self.data()[offset..])?;
        self.data_mut()[start..start + current].copy_from_slice(value);
        Ok(())
    }

    /// Keeps the first `new_size` entries, rewriting them compactly.
    pub(crate) fn shrink(&mut self, new_size: usize) -> Result<()> {
        let kept = (0..new_size.min(self.size()))
            .map(|index| self.raw_entry(index).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        let page_size = self.data().len();
        self.set_size(0)?;
        self.set_free_pointer(page_size);
        self.add_all(&kept)
    }

    /// Appends raw entries in order.
    pub(crate) fn add_all(&mut self, entries: &[Vec<u8>]) -> Result<()> {
        for entry in entries {
            let size = self.size();
            if !self.insert_entry(size, &[entry.as_slice()])? {
                return Err(RidbagError::Corruption("bucket overflow during bulk append"));
            }
        }
        Ok(())
    }

    /// Flips an empty bucket between leaf and internal.
    pub(crate) fn switch_bucket_type(&mut self) -> Result<()> {
        if !self.is_empty() {
            return Err(RidbagError::Corruption("bucket type switched while non-empty"));
        }
        let flags = self.data()[FLAGS_OFFSET] ^ LEAF_FLAG;
        self.data_mut()[FLAGS_OFFSET] = flags;
        Ok(())
    }
}

fn decode_page_id(raw: u64) -> Option<PageId> {
    (raw != 0).then_some(PageId(raw))
}

fn encode_page_id(id: Option<PageId>) -> u64 {
    id.map_or(0, |id| id.0)
}
