//! Durable ordered map over bucket pages.
//!
//! Page 0 of the tree file is the entry point, page 1 the root. Structural
//! changes run inside one atomic operation while the tree's component lock
//! is held, so a put or remove (including every split it causes) becomes
//! durable as a unit.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use super::bucket::{self, Bucket};
use super::codecs::{EdgeKey, KeyCodec, ValCodec};
use super::entry_point::{EntryPoint, ENTRY_POINT_PAGE, ROOT_PAGE};
use super::iter::{Direction, RangeIter, ScanBound};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::primitives::concurrency::{LockSnapshot, SharedExclusiveLock};
use crate::primitives::pager::{AtomicOperation, AtomicOperationsManager, Pager};
use crate::types::{FileId, PageId, Result, RidbagError};

pub(crate) mod search;
mod split;
mod verify;

pub use verify::VerifyReport;

/// Binary search outcome inside a bucket: `Ok(index)` on a match, otherwise
/// `Err(insertion point)`.
pub(crate) type SearchResult = std::result::Result<usize, usize>;

/// Tree used for rid-bags: edge key to link counter.
pub type RidBagTree = BTree<EdgeKey, i32>;

/// Configuration knobs for a tree.
#[derive(Clone, Debug)]
pub struct BTreeOptions {
    /// Deepest root-to-leaf path accepted before the tree is reported corrupt.
    pub max_path_length: usize,
    /// Entries read per iterator batch.
    pub iterator_batch_size: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            max_path_length: 64,
            iterator_batch_size: 10,
        }
    }
}

impl BTreeOptions {
    /// Rejects zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_path_length == 0 {
            return Err(RidbagError::Invalid("max_path_length must be non-zero"));
        }
        if self.iterator_batch_size == 0 {
            return Err(RidbagError::Invalid("iterator_batch_size must be non-zero"));
        }
        Ok(())
    }
}

/// On-disk B-tree stored in its own pager file.
pub struct BTree<K: KeyCodec, V: ValCodec> {
    name: String,
    file_id: FileId,
    manager: Arc<AtomicOperationsManager>,
    options: BTreeOptions,
    lock: SharedExclusiveLock,
    stats: Arc<BTreeStats>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    /// Creates the tree file `name` with an empty root leaf.
    pub fn create(
        manager: &Arc<AtomicOperationsManager>,
        name: &str,
        options: BTreeOptions,
    ) -> Result<Self> {
        options.validate()?;
        let pager = manager.pager();
        let file_id = manager
            .calculate_inside_atomic_operation(|op| {
                manager.calculate_inside_component_operation(op, name, |op| {
                    let file_id = pager.add_file(op, name)?;
                    let mut entry = pager.add_page(op, file_id)?;
                    if entry.id != ENTRY_POINT_PAGE {
                        return Err(RidbagError::Corruption("entry point not at page 0"));
                    }
                    EntryPoint::new(entry.data_mut()).init();
                    drop(entry);
                    let mut root = pager.add_page(op, file_id)?;
                    if root.id != ROOT_PAGE {
                        return Err(RidbagError::Corruption("root not at page 1"));
                    }
                    Bucket::<_, K, V>::new(root.data_mut()).init(true)?;
                    Ok(file_id)
                })
            })
            .map_err(|err| err.in_component(name, "create"))?;
        debug!(tree = name, file = file_id.0, "btree.create");
        Ok(Self::with_file(manager, name, file_id, options))
    }

    /// Opens an existing tree file.
    pub fn load(
        manager: &Arc<AtomicOperationsManager>,
        name: &str,
        options: BTreeOptions,
    ) -> Result<Self> {
        options.validate()?;
        let load = || -> Result<FileId> {
            let pager = manager.pager();
            let file_id = pager.open_file(None, name)?;
            let page = pager.load_page_for_read(None, file_id, ENTRY_POINT_PAGE)?;
            EntryPoint::new(page.data()).check()?;
            Ok(file_id)
        };
        let file_id = load().map_err(|err| err.in_component(name, "load"))?;
        Ok(Self::with_file(manager, name, file_id, options))
    }

    fn with_file(
        manager: &Arc<AtomicOperationsManager>,
        name: &str,
        file_id: FileId,
        options: BTreeOptions,
    ) -> Self {
        Self {
            name: name.to_owned(),
            file_id,
            manager: Arc::clone(manager),
            options,
            lock: SharedExclusiveLock::new(),
            stats: Arc::new(BTreeStats::default()),
            _marker: PhantomData,
        }
    }

    /// Removes the tree file. The file disappears when the operation commits.
    pub fn delete(self) -> Result<()> {
        let result = self.manager.execute_inside_atomic_operation(|op| {
            self.manager
                .execute_inside_component_operation(op, &self.name, |op| {
                    let _exclusive = self.lock.exclusive();
                    self.pager().delete_file(op, self.file_id)
                })
        });
        result.map_err(|err| err.in_component(&self.name, "delete"))?;
        debug!(tree = %self.name, "btree.delete");
        Ok(())
    }

    /// Tree name, also its component lock name and file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pager file holding the tree.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the current statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing(&self.name);
    }

    /// State of the tree's shared/exclusive lock.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.lock.snapshot()
    }

    /// Looks up `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.read_locked(None, || self.get_in(None, key))
            .map_err(|err| err.in_component(&self.name, "get"))
    }

    /// Looks up `key`, seeing the uncommitted writes of `op`.
    pub fn get_with(&self, op: &AtomicOperation, key: &K) -> Result<Option<V>> {
        self.read_locked(Some(op), || self.get_in(Some(op), key))
            .map_err(|err| err.in_component(&self.name, "get"))
    }

    fn get_in(&self, op: Option<&AtomicOperation>, key: &K) -> Result<Option<V>> {
        let encoded = encode_key(key);
        let hit = self.find_bucket(op, &encoded)?;
        match hit.item {
            Ok(index) => Ok(Some(view::<K, V>(hit.page.data()).value(index)?)),
            Err(_) => Ok(None),
        }
    }

    /// Inserts or replaces `key`. Returns true when the key was not present.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        self.manager
            .calculate_inside_atomic_operation(|op| self.put_in(op, key, value))
            .map_err(|err| err.in_component(&self.name, "put"))
    }

    /// [`Self::put`] as part of the caller's operation.
    pub fn put_with(&self, op: &AtomicOperation, key: &K, value: &V) -> Result<bool> {
        self.put_in(op, key, value)
            .map_err(|err| err.in_component(&self.name, "put"))
    }

    fn put_in(&self, op: &AtomicOperation, key: &K, value: &V) -> Result<bool> {
        let encoded_key = encode_key(key);
        let mut encoded_value = Vec::new();
        V::encode_val(value, &mut encoded_value);
        self.check_entry_fits(&encoded_key, &encoded_value)?;
        self.manager
            .calculate_inside_component_operation(op, &self.name, |op| {
                let _exclusive = self.lock.exclusive();
                self.put_locked(op, &encoded_key, &encoded_value)
            })
    }

    fn put_locked(&self, op: &AtomicOperation, key: &[u8], value: &[u8]) -> Result<bool> {
        let pager = self.pager();
        let path = self.find_bucket_for_update(op, key)?;
        let mut pages = path.pages;
        let mut indexes = path.indexes;
        let mut leaf = *pages.last().ok_or(RidbagError::Corruption("empty search path"))?;
        let mut depth = pages.len();
        let (mut index, inserted) = match path.item {
            Ok(index) => {
                let mut page = pager.load_page_for_write(op, self.file_id, leaf)?;
                let mut bucket = Bucket::<_, K, V>::new(page.data_mut());
                if bucket.value_bytes(index)?.len() == value.len() {
                    bucket.update_value(index, value)?;
                    self.stats.inc_updates();
                    return Ok(false);
                }
                bucket.remove_leaf_entry(index)?;
                (index, false)
            }
            Err(index) => (index, true),
        };
        loop {
            let added = {
                let mut page = pager.load_page_for_write(op, self.file_id, leaf)?;
                Bucket::<_, K, V>::new(page.data_mut()).add_leaf_entry(index, key, value)?
            };
            if added {
                break;
            }
            let split = self.split_bucket(op, &pages, &indexes, index, depth)?;
            depth = depth.max(split.pages.len());
            pages = split.pages;
            indexes = split.indexes;
            index = split.item_index;
            leaf = *pages.last().ok_or(RidbagError::Corruption("empty split path"))?;
        }
        if inserted {
            self.adjust_size(op, 1)?;
            self.stats.inc_inserts();
        } else {
            self.stats.inc_updates();
        }
        Ok(inserted)
    }

    /// Removes `key`, returning its value when it was present.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.manager
            .calculate_inside_atomic_operation(|op| self.remove_in(op, key))
            .map_err(|err| err.in_component(&self.name, "remove"))
    }

    /// [`Self::remove`] as part of the caller's operation.
    pub fn remove_with(&self, op: &AtomicOperation, key: &K) -> Result<Option<V>> {
        self.remove_in(op, key)
            .map_err(|err| err.in_component(&self.name, "remove"))
    }

    fn remove_in(&self, op: &AtomicOperation, key: &K) -> Result<Option<V>> {
        let encoded = encode_key(key);
        self.manager
            .calculate_inside_component_operation(op, &self.name, |op| {
                let _exclusive = self.lock.exclusive();
                let hit = self.find_bucket(Some(op), &encoded)?;
                let Ok(index) = hit.item else {
                    return Ok(None);
                };
                let leaf = hit.page.id;
                drop(hit);
                let value = {
                    let mut page = self.pager().load_page_for_write(op, self.file_id, leaf)?;
                    let mut bucket = Bucket::<_, K, V>::new(page.data_mut());
                    let value = bucket.value(index)?;
                    bucket.remove_leaf_entry(index)?;
                    value
                };
                self.adjust_size(op, -1)?;
                self.stats.inc_removes();
                Ok(Some(value))
            })
    }

    /// Smallest key, or `None` for an empty tree.
    pub fn first_key(&self) -> Result<Option<K>> {
        self.read_locked(None, || self.edge_key(search::Edge::First))
            .map_err(|err| err.in_component(&self.name, "first_key"))
    }

    /// Largest key, or `None` for an empty tree.
    pub fn last_key(&self) -> Result<Option<K>> {
        self.read_locked(None, || self.edge_key(search::Edge::Last))
            .map_err(|err| err.in_component(&self.name, "last_key"))
    }

    fn edge_key(&self, edge: search::Edge) -> Result<Option<K>> {
        match self.edge_item(None, edge)? {
            Some((page, index)) => Ok(Some(view::<K, V>(page.data()).key(index)?)),
            None => Ok(None),
        }
    }

    /// Number of entries, as recorded on the entry point.
    pub fn size(&self) -> Result<u64> {
        self.read_locked(None, || {
            let page = self
                .pager()
                .load_page_for_read(None, self.file_id, ENTRY_POINT_PAGE)?;
            Ok(EntryPoint::new(page.data()).tree_size())
        })
        .map_err(|err| err.in_component(&self.name, "size"))
    }

    /// Entries with keys below `to` (or equal when `to_inclusive`).
    pub fn iterate_entries_minor(
        &self,
        to: &K,
        to_inclusive: bool,
        ascending: bool,
    ) -> RangeIter<'_, K, V> {
        RangeIter::new(
            self,
            None,
            Some(ScanBound::new(encode_key(to), to_inclusive)),
            direction(ascending),
        )
    }

    /// Entries with keys above `from` (or equal when `from_inclusive`).
    pub fn iterate_entries_major(
        &self,
        from: &K,
        from_inclusive: bool,
        ascending: bool,
    ) -> RangeIter<'_, K, V> {
        RangeIter::new(
            self,
            Some(ScanBound::new(encode_key(from), from_inclusive)),
            None,
            direction(ascending),
        )
    }

    /// Entries with keys between `from` and `to`.
    pub fn iterate_entries_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        ascending: bool,
    ) -> RangeIter<'_, K, V> {
        RangeIter::new(
            self,
            Some(ScanBound::new(encode_key(from), from_inclusive)),
            Some(ScanBound::new(encode_key(to), to_inclusive)),
            direction(ascending),
        )
    }

    /// Every entry in ascending key order.
    pub fn iter(&self) -> RangeIter<'_, K, V> {
        RangeIter::new(self, None, None, Direction::Forward)
    }

    /// Every entry in descending key order.
    pub fn iter_rev(&self) -> RangeIter<'_, K, V> {
        RangeIter::new(self, None, None, Direction::Backward)
    }

    pub(crate) fn pager(&self) -> &Arc<Pager> {
        self.manager.pager()
    }

    /// Runs a read path under the component read lock and the shared tree
    /// lock. The component lock is skipped when `op` already owns it.
    pub(crate) fn read_locked<T>(
        &self,
        op: Option<&AtomicOperation>,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _component = match op {
            Some(op) if op.holds_component(&self.name) => None,
            _ => Some(self.manager.acquire_read_lock(&self.name)),
        };
        let _shared = self.lock.shared();
        body()
    }

    pub(crate) fn stats_ref(&self) -> &BTreeStats {
        &self.stats
    }

    fn adjust_size(&self, op: &AtomicOperation, delta: i64) -> Result<()> {
        let mut page = self
            .pager()
            .load_page_for_write(op, self.file_id, ENTRY_POINT_PAGE)?;
        let mut entry = EntryPoint::new(page.data_mut());
        let size = entry
            .tree_size()
            .checked_add_signed(delta)
            .ok_or(RidbagError::Corruption("tree size out of range"))?;
        entry.set_tree_size(size);
        Ok(())
    }

    /// Hands out a bucket page: the page after the high-water mark when the
    /// file already has it, otherwise a new one.
    fn allocate_page(&self, op: &AtomicOperation) -> Result<crate::primitives::pager::PageMut> {
        let pager = self.pager();
        let next = {
            let page = pager.load_page_for_read(Some(op), self.file_id, ENTRY_POINT_PAGE)?;
            EntryPoint::new(page.data()).pages_size() + 1
        };
        let page = if next < pager.filled_up_to(Some(op), self.file_id)? {
            pager.load_page_for_write(op, self.file_id, PageId(next))?
        } else {
            pager.add_page(op, self.file_id)?
        };
        let mut entry = pager.load_page_for_write(op, self.file_id, ENTRY_POINT_PAGE)?;
        EntryPoint::new(entry.data_mut()).set_pages_size(page.id.0);
        Ok(page)
    }

    /// Rejects entries too large for a split to always make room.
    fn check_entry_fits(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let capacity = bucket::capacity(self.pager().page_size());
        let leaf_entry = key.len() + value.len() + 2;
        let internal_entry = key.len() + 18;
        if leaf_entry > capacity / 2 || internal_entry > capacity / 3 {
            return Err(RidbagError::InvalidOwned(format!(
                "entry of {} bytes does not fit a {} byte page",
                key.len() + value.len(),
                self.pager().page_size()
            )));
        }
        Ok(())
    }
}

fn direction(ascending: bool) -> Direction {
    if ascending {
        Direction::Forward
    } else {
        Direction::Backward
    }
}

pub(crate) fn encode_key<K: KeyCodec>(key: &K) -> Vec<u8> {
    let mut out = Vec::new();
    K::encode_key(key, &mut out);
    out
}

pub(crate) fn view<K: KeyCodec, V: ValCodec>(data: &[u8]) -> Bucket<&[u8], K, V> {
    Bucket::new(data)
}
