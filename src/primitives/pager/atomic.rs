//! Atomic operations: all-or-nothing groups of page writes.
//!
//! An [`AtomicOperation`] keeps private copies of every page it writes. Nothing
//! reaches the page cache or the WAL until [`AtomicOperationsManager::commit`];
//! dropping an uncommitted operation discards its copies, which is the whole
//! rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use tracing::debug;

use super::pager::{PageKey, Pager};
use crate::primitives::concurrency::{ComponentLocks, ComponentReadGuard, ComponentWriteGuard};
use crate::types::{FileId, Lsn, Result, RidbagError};

pub(crate) type ShadowPage = Arc<Mutex<Box<[u8]>>>;
pub(crate) type ShadowGuard = ArcMutexGuard<RawMutex, Box<[u8]>>;

/// A unit of work whose page writes become durable together or not at all.
///
/// Operations are confined to the thread that started them. Component locks
/// taken through [`AtomicOperationsManager::calculate_inside_component_operation`]
/// stay held until the operation commits or is dropped.
pub struct AtomicOperation {
    id: u64,
    shadows: Mutex<BTreeMap<PageKey, ShadowPage>>,
    filled: Mutex<HashMap<FileId, u64>>,
    new_files: Mutex<Vec<(FileId, String)>>,
    deleted_files: Mutex<Vec<FileId>>,
    components: Mutex<HashMap<String, ComponentWriteGuard>>,
    rollback_only: AtomicBool,
    committed: bool,
}

impl AtomicOperation {
    fn new(id: u64) -> Self {
        Self {
            id,
            shadows: Mutex::new(BTreeMap::new()),
            filled: Mutex::new(HashMap::new()),
            new_files: Mutex::new(Vec::new()),
            deleted_files: Mutex::new(Vec::new()),
            components: Mutex::new(HashMap::new()),
            rollback_only: AtomicBool::new(false),
            committed: false,
        }
    }

    /// Operation id, unique within one manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forces the operation to roll back instead of committing.
    pub fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// True once a component body failed inside this operation.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// True when this operation holds the exclusive lock of `component`.
    pub fn holds_component(&self, component: &str) -> bool {
        self.components.lock().contains_key(component)
    }

    /// Number of pages written so far.
    pub fn dirty_pages(&self) -> usize {
        self.shadows.lock().len()
    }

    pub(crate) fn shadow(&self, key: &PageKey) -> Option<ShadowPage> {
        self.shadows.lock().get(key).cloned()
    }

    pub(crate) fn shadow_or_insert_with(
        &self,
        key: PageKey,
        load: impl FnOnce() -> Result<Box<[u8]>>,
    ) -> Result<ShadowPage> {
        let mut shadows = self.shadows.lock();
        if let Some(existing) = shadows.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let page = Arc::new(Mutex::new(load()?));
        shadows.insert(key, Arc::clone(&page));
        Ok(page)
    }

    pub(crate) fn insert_shadow(&self, key: PageKey, image: Box<[u8]>) -> ShadowPage {
        let page = Arc::new(Mutex::new(image));
        self.shadows.lock().insert(key, Arc::clone(&page));
        page
    }

    /// Removes every page copy, ordered by file and page index.
    pub(crate) fn take_shadows(&self) -> Vec<(PageKey, Box<[u8]>)> {
        let shadows = std::mem::take(&mut *self.shadows.lock());
        shadows
            .into_iter()
            .map(|(key, page)| {
                let image = match Arc::try_unwrap(page) {
                    Ok(mutex) => mutex.into_inner(),
                    Err(shared) => shared.lock().clone(),
                };
                (key, image)
            })
            .collect()
    }

    pub(crate) fn filled_up_to(&self, file: FileId) -> Option<u64> {
        self.filled.lock().get(&file).copied()
    }

    pub(crate) fn set_filled_up_to(&self, file: FileId, filled: u64) {
        self.filled.lock().insert(file, filled);
    }

    pub(crate) fn filled_snapshot(&self) -> Vec<(FileId, u64)> {
        self.filled.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub(crate) fn register_new_file(&self, id: FileId, name: String) {
        self.new_files.lock().push((id, name));
    }

    pub(crate) fn new_file_named(&self, name: &str) -> Option<FileId> {
        self.new_files
            .lock()
            .iter()
            .find(|(_, existing)| existing == name)
            .map(|(id, _)| *id)
    }

    pub(crate) fn is_new_file(&self, id: FileId) -> bool {
        self.new_files.lock().iter().any(|(existing, _)| *existing == id)
    }

    pub(crate) fn new_files(&self) -> Vec<(FileId, String)> {
        self.new_files.lock().clone()
    }

    /// Forgets a file created earlier in this operation.
    pub(crate) fn discard_new_file(&self, id: FileId) {
        self.new_files.lock().retain(|(existing, _)| *existing != id);
        self.filled.lock().remove(&id);
        self.shadows.lock().retain(|key, _| key.0 != id);
    }

    pub(crate) fn mark_deleted(&self, id: FileId) {
        let mut deleted = self.deleted_files.lock();
        if !deleted.contains(&id) {
            deleted.push(id);
        }
    }

    pub(crate) fn is_deleted(&self, id: FileId) -> bool {
        self.deleted_files.lock().contains(&id)
    }

    pub(crate) fn deleted_files(&self) -> Vec<FileId> {
        self.deleted_files.lock().clone()
    }

    fn hold_component(&self, component: &str, guard: ComponentWriteGuard) {
        self.components.lock().insert(component.to_owned(), guard);
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.committed {
            let pages = self.shadows.get_mut().len();
            let files = self.new_files.get_mut().len();
            if pages > 0 || files > 0 {
                debug!(op = self.id, pages, files, "atomic_op.rollback");
            }
        }
    }
}

/// Coordinates atomic operations and component locks over one [`Pager`].
pub struct AtomicOperationsManager {
    pager: Arc<Pager>,
    locks: ComponentLocks,
    next_op_id: AtomicU64,
}

impl AtomicOperationsManager {
    /// Creates a manager for `pager`.
    pub fn new(pager: Arc<Pager>) -> Self {
        Self {
            pager,
            locks: ComponentLocks::default(),
            next_op_id: AtomicU64::new(1),
        }
    }

    /// The page cache this manager commits into.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Starts an empty operation bound to the calling thread.
    pub fn start_atomic_operation(&self) -> AtomicOperation {
        AtomicOperation::new(self.next_op_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes every page write of `op` durable under one LSN and releases the
    /// component locks it holds. A rollback-only operation is discarded and
    /// reported as an error.
    pub fn commit(&self, mut op: AtomicOperation) -> Result<Lsn> {
        if op.is_rollback_only() {
            return Err(RidbagError::Invalid(
                "atomic operation marked rollback-only",
            ));
        }
        let lsn = self.pager.commit(&op)?;
        op.committed = true;
        debug!(op = op.id, lsn = lsn.0, "atomic_op.commit");
        Ok(lsn)
    }

    /// Runs `body` in a fresh operation, committing on success and rolling
    /// back on error.
    pub fn calculate_inside_atomic_operation<T>(
        &self,
        body: impl FnOnce(&AtomicOperation) -> Result<T>,
    ) -> Result<T> {
        let op = self.start_atomic_operation();
        let value = body(&op)?;
        self.commit(op)?;
        Ok(value)
    }

    /// [`Self::calculate_inside_atomic_operation`] without a result value.
    pub fn execute_inside_atomic_operation(
        &self,
        body: impl FnOnce(&AtomicOperation) -> Result<()>,
    ) -> Result<()> {
        self.calculate_inside_atomic_operation(body)
    }

    /// Runs `body` as part of `op` while holding `component` exclusively.
    ///
    /// The lock is taken on first use and kept until `op` finishes, so nested
    /// calls for the same component are allowed. A failing body marks `op`
    /// rollback-only.
    ///
    /// The calling thread must not hold a read lock on `component`, and must not
    /// take one while `op` is alive: component locks are not reentrant across
    /// modes.
    pub fn calculate_inside_component_operation<T>(
        &self,
        op: &AtomicOperation,
        component: &str,
        body: impl FnOnce(&AtomicOperation) -> Result<T>,
    ) -> Result<T> {
        if !op.holds_component(component) {
            let guard = self.locks.write(component);
            op.hold_component(component, guard);
        }
        body(op).map_err(|err| {
            op.mark_rollback_only();
            err
        })
    }

    /// [`Self::calculate_inside_component_operation`] without a result value.
    pub fn execute_inside_component_operation(
        &self,
        op: &AtomicOperation,
        component: &str,
        body: impl FnOnce(&AtomicOperation) -> Result<()>,
    ) -> Result<()> {
        self.calculate_inside_component_operation(op, component, body)
    }

    /// Blocks structural changes to `component` while the guard lives.
    pub fn acquire_read_lock(&self, component: &str) -> ComponentReadGuard {
        self.locks.read(component)
    }

    /// Flushes committed pages to their data files and truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.pager.checkpoint()
    }
}
