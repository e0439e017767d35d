use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{lock_api::ArcRwLockReadGuard, Mutex, RawRwLock, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::atomic::{AtomicOperation, ShadowGuard};
use super::frame::{Frame, PinGuard};
use super::manifest::{
    create_manifest, data_file_path, load_manifest, manifest_exists, validate_file_name,
    write_manifest, Manifest, ManifestFile, WAL_FILE,
};
use crate::primitives::{
    io::{FileIo, StdFileIo},
    wal::{Wal, WalFileChange, WalOptions, WalPage, WalRecord},
};
use crate::types::{
    page::{self, MAX_PAGE_SIZE, MIN_PAGE_SIZE},
    FileId, Lsn, PageId, Result, RidbagError,
};

/// Cache key: a page of a file.
pub type PageKey = (FileId, PageId);

/// Configuration options for the pager.
///
/// These options control page size, caching behavior, durability guarantees,
/// and automatic checkpoint triggers.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes. Fixed when the directory is created.
    pub page_size: u32,
    /// Number of pages to cache in memory. Pinned pages may push the cache
    /// past this bound temporarily.
    pub cache_pages: usize,
    /// Durability mode for write-ahead log synchronization.
    pub synchronous: Synchronous,
    /// Number of WAL page frames before an automatic checkpoint; 0 disables it.
    pub autocheckpoint_frames: u64,
    /// Verify page checksums when reading from data files.
    pub checksum_verify_on_read: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            synchronous: Synchronous::Full,
            autocheckpoint_frames: 1000,
            checksum_verify_on_read: true,
        }
    }
}

impl PagerOptions {
    /// Rejects page sizes outside the supported range and an empty cache.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(RidbagError::InvalidOwned(format!(
                "page size {} outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.cache_pages == 0 {
            return Err(RidbagError::Invalid("cache_pages must be non-zero"));
        }
        Ok(())
    }
}

/// Durability mode for write-ahead log synchronization.
///
/// Controls when the WAL is synchronized to disk, trading performance for durability.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Synchronous {
    /// Sync to disk after each commit (most durable).
    #[default]
    Full,
    /// Sync before data pages are written back and at checkpoints.
    Normal,
    /// No explicit WAL syncs (fastest but least durable).
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Snapshot of pager counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PagerStats {
    /// Page lookups served from the cache.
    pub hits: u64,
    /// Page lookups that read a data file.
    pub misses: u64,
    /// Frames dropped from the cache.
    pub evictions: u64,
    /// Dirty frames written to a data file.
    pub writebacks: u64,
    /// Committed atomic operations.
    pub commits: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Committed operations replayed from the WAL at open.
    pub recovered_commits: u64,
}

#[derive(Default)]
struct PagerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    commits: AtomicU64,
    checkpoints: AtomicU64,
    recovered_commits: AtomicU64,
}

impl PagerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> PagerStats {
        PagerStats {
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
            writebacks: self.writebacks.load(AtomicOrdering::Relaxed),
            commits: self.commits.load(AtomicOrdering::Relaxed),
            checkpoints: self.checkpoints.load(AtomicOrdering::Relaxed),
            recovered_commits: self.recovered_commits.load(AtomicOrdering::Relaxed),
        }
    }
}

struct FileHandle {
    io: Arc<dyn FileIo>,
    filled_up_to: AtomicU64,
}

/// A WAL record waiting for its commit record during recovery.
enum Staged {
    Page(FileId, PageId, Vec<u8>),
    Added(FileId, String),
    Dropped(FileId),
}

struct CommitState {
    next_lsn: u64,
    frames_since_checkpoint: u64,
}

/// A page pinned for reading.
///
/// Either a cached frame under a shared lock, or the private copy of an
/// atomic operation that already wrote the page. Dropping releases both the
/// lock and the pin.
pub struct PageRef {
    /// Page identifier.
    pub id: PageId,
    inner: PageRefInner,
}

enum PageRefInner {
    Cached {
        guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
        _pin: PinGuard,
    },
    Private(ShadowGuard),
}

impl PageRef {
    /// Returns the page data as a byte slice.
    pub fn data(&self) -> &[u8] {
        match &self.inner {
            PageRefInner::Cached { guard, .. } => &guard[..],
            PageRefInner::Private(guard) => &guard[..],
        }
    }
}

/// A page opened for writing inside an atomic operation.
///
/// Writes land in the operation's private copy of the page.
pub struct PageMut {
    /// Page identifier.
    pub id: PageId,
    guard: ShadowGuard,
}

impl PageMut {
    /// Returns the page data as an immutable byte slice.
    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    /// Returns the page data as a mutable byte slice.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}

/// Page cache over a directory of data files sharing one WAL.
pub struct Pager {
    dir: PathBuf,
    options: PagerOptions,
    page_size: usize,
    manifest: Mutex<Manifest>,
    files: RwLock<HashMap<FileId, Arc<FileHandle>>>,
    cache: Mutex<LruCache<PageKey, Arc<Frame>>>,
    wal: Wal,
    wal_dirty: AtomicBool,
    next_file_id: AtomicU32,
    commit_state: Mutex<CommitState>,
    counters: PagerCounters,
}

impl Pager {
    /// Creates a new, empty database directory.
    pub fn create(dir: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        if manifest_exists(dir) {
            return Err(RidbagError::InvalidOwned(format!(
                "database already exists at {}",
                dir.display()
            )));
        }
        let manifest = create_manifest(options.page_size);
        // A stale log from an earlier directory would fail the salt check.
        let wal_path = dir.join(WAL_FILE);
        if wal_path.exists() {
            fs::remove_file(&wal_path)?;
        }
        write_manifest(dir, &manifest)?;
        info!(
            dir = %dir.display(),
            page_size = options.page_size,
            synchronous = options.synchronous.as_str(),
            "pager.create"
        );
        Self::open_with_manifest(dir, options, manifest)
    }

    /// Opens an existing directory, replaying committed WAL records.
    pub fn open(dir: impl AsRef<Path>, mut options: PagerOptions) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest = load_manifest(dir)?;
        if options.page_size != manifest.page_size {
            debug!(
                requested = options.page_size,
                stored = manifest.page_size,
                "pager.open.page_size_override"
            );
            options.page_size = manifest.page_size;
        }
        options.validate()?;
        Self::open_with_manifest(dir, options, manifest)
    }

    /// Opens `dir` if it holds a database, otherwise creates one.
    pub fn open_or_create(dir: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        if manifest_exists(dir.as_ref()) {
            Self::open(dir, options)
        } else {
            Self::create(dir, options)
        }
    }

    fn open_with_manifest(dir: &Path, options: PagerOptions, manifest: Manifest) -> Result<Self> {
        let page_size = options.page_size as usize;
        let mut files = HashMap::new();
        for file in &manifest.files {
            let io = StdFileIo::open(data_file_path(dir, &file.name))?;
            let filled = io.len()? / page_size as u64;
            files.insert(
                FileId(file.id),
                Arc::new(FileHandle {
                    io: Arc::new(io),
                    filled_up_to: AtomicU64::new(filled),
                }),
            );
        }
        let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.join(WAL_FILE))?);
        let wal = Wal::open(
            wal_io,
            WalOptions::new(options.page_size, manifest.wal_salt, Lsn(1)),
        )?;
        let next_file_id = manifest.next_file_id;
        let pager = Self {
            dir: dir.to_path_buf(),
            page_size,
            manifest: Mutex::new(manifest),
            files: RwLock::new(files),
            cache: Mutex::new(LruCache::unbounded()),
            wal,
            wal_dirty: AtomicBool::new(false),
            next_file_id: AtomicU32::new(next_file_id),
            commit_state: Mutex::new(CommitState {
                next_lsn: 1,
                frames_since_checkpoint: 0,
            }),
            counters: PagerCounters::default(),
            options,
        };
        let next_lsn = pager.recover()?;
        pager.commit_state.lock().next_lsn = next_lsn.0;
        Ok(pager)
    }

    /// Replays every committed group in the WAL into the data files and the
    /// manifest, then truncates the log. Returns the next LSN to assign.
    fn recover(&self) -> Result<Lsn> {
        let start_lsn = self.wal.start_lsn();
        let mut iter = self.wal.iter()?;
        let mut pending: Vec<Staged> = Vec::new();
        let mut pending_lsn: Option<Lsn> = None;
        let mut last_committed: Option<Lsn> = None;
        let mut touched: HashSet<FileId> = HashSet::new();
        let mut manifest_changed = false;
        let mut applied = 0u64;
        while let Some(record) = iter.next_record()? {
            let (lsn, staged) = match record {
                WalRecord::Commit { lsn } => {
                    if pending_lsn == Some(lsn) {
                        let group = std::mem::take(&mut pending);
                        manifest_changed |= self.apply_recovered_group(group, &mut touched)?;
                    }
                    pending.clear();
                    pending_lsn = None;
                    last_committed = Some(lsn);
                    applied += 1;
                    continue;
                }
                WalRecord::Page {
                    lsn,
                    file_id,
                    page_id,
                    payload,
                } => (lsn, Staged::Page(file_id, page_id, payload)),
                WalRecord::FileAdded { lsn, file_id, name } => (lsn, Staged::Added(file_id, name)),
                WalRecord::FileDropped { lsn, file_id } => (lsn, Staged::Dropped(file_id)),
            };
            if pending_lsn != Some(lsn) {
                if !pending.is_empty() {
                    warn!(
                        lsn = pending_lsn.map(|l| l.0),
                        "wal.recover.discard_uncommitted"
                    );
                }
                pending.clear();
                pending_lsn = Some(lsn);
            }
            pending.push(staged);
        }
        if !pending.is_empty() {
            warn!(
                frames = pending.len(),
                lsn = pending_lsn.map(|l| l.0),
                "wal.recover.discard_torn_tail"
            );
        }
        {
            let files = self.files.read();
            for file_id in &touched {
                if let Some(handle) = files.get(file_id) {
                    handle.io.sync_all()?;
                }
            }
        }
        if manifest_changed {
            let snapshot = self.manifest.lock().clone();
            write_manifest(&self.dir, &snapshot)?;
        }
        let next = last_committed
            .map(|lsn| lsn.0 + 1)
            .unwrap_or(0)
            .max(start_lsn.0)
            .max(1);
        self.wal.reset(Lsn(next))?;
        self.counters
            .recovered_commits
            .fetch_add(applied, AtomicOrdering::Relaxed);
        if applied > 0 {
            info!(commits = applied, next_lsn = next, "wal.recover");
        }
        Ok(Lsn(next))
    }

    /// Applies one committed group: new files first, then pages, then
    /// removals. Returns true when the manifest changed.
    fn apply_recovered_group(
        &self,
        group: Vec<Staged>,
        touched: &mut HashSet<FileId>,
    ) -> Result<bool> {
        let mut changed = false;
        let mut pages = Vec::new();
        let mut dropped = Vec::new();
        for staged in group {
            match staged {
                Staged::Added(file_id, name) => changed |= self.recover_added_file(file_id, &name)?,
                Staged::Page(file_id, page_id, payload) => pages.push((file_id, page_id, payload)),
                Staged::Dropped(file_id) => dropped.push(file_id),
            }
        }
        for (file_id, page_id, payload) in pages {
            if self.apply_recovered_page(file_id, page_id, &payload)? {
                touched.insert(file_id);
            }
        }
        for file_id in dropped {
            changed |= self.recover_dropped_file(file_id);
            touched.remove(&file_id);
        }
        Ok(changed)
    }

    fn recover_added_file(&self, file_id: FileId, name: &str) -> Result<bool> {
        let mut manifest = self.manifest.lock();
        if manifest.name_of(file_id).is_some() {
            return Ok(false);
        }
        if manifest.lookup(name).is_some() {
            // A later commit already reused the name under a newer id.
            warn!(file = file_id.0, name, "wal.recover.name_taken");
            return Ok(false);
        }
        validate_file_name(name)?;
        // Every page of a file created after the last checkpoint is in the
        // log, so whatever the data file holds is stale.
        let io = StdFileIo::open(data_file_path(&self.dir, name))?;
        io.truncate(0)?;
        self.files.write().insert(
            file_id,
            Arc::new(FileHandle {
                io: Arc::new(io),
                filled_up_to: AtomicU64::new(0),
            }),
        );
        manifest.files.push(ManifestFile {
            id: file_id.0,
            name: name.to_owned(),
        });
        manifest.next_file_id = manifest.next_file_id.max(file_id.0 + 1);
        self.next_file_id
            .fetch_max(file_id.0 + 1, AtomicOrdering::SeqCst);
        info!(file = file_id.0, name, "wal.recover.file_added");
        Ok(true)
    }

    fn recover_dropped_file(&self, file_id: FileId) -> bool {
        let name = {
            let mut manifest = self.manifest.lock();
            let Some(pos) = manifest.files.iter().position(|file| file.id == file_id.0) else {
                return false;
            };
            manifest.files.remove(pos).name
        };
        self.files.write().remove(&file_id);
        let path = data_file_path(&self.dir, &name);
        if let Err(err) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %err, "wal.recover.unlink_failed");
        }
        info!(file = file_id.0, name = %name, "wal.recover.file_dropped");
        true
    }

    fn apply_recovered_page(&self, file_id: FileId, page_id: PageId, payload: &[u8]) -> Result<bool> {
        let files = self.files.read();
        let Some(handle) = files.get(&file_id) else {
            warn!(file = file_id.0, page = page_id.0, "wal.recover.unknown_file");
            return Ok(false);
        };
        handle
            .io
            .write_at(page_id.0 * self.page_size as u64, payload)?;
        handle
            .filled_up_to
            .fetch_max(page_id.0 + 1, AtomicOrdering::SeqCst);
        Ok(true)
    }

    /// Page size shared by all files.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Options the pager was opened with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Directory holding the manifest, WAL, and data files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns current counters.
    pub fn stats(&self) -> PagerStats {
        self.counters.snapshot()
    }

    /// Logs current counters.
    pub fn emit_tracing(&self) {
        let stats = self.stats();
        tracing::info!(
            target: "ridbag::stats",
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            writebacks = stats.writebacks,
            commits = stats.commits,
            checkpoints = stats.checkpoints,
            recovered_commits = stats.recovered_commits,
            "pager stats snapshot"
        );
    }

    /// Names of every registered data file with its id.
    pub fn files(&self) -> Vec<(FileId, String)> {
        self.manifest
            .lock()
            .files
            .iter()
            .map(|file| (FileId(file.id), file.name.clone()))
            .collect()
    }

    /// LSN the next commit will receive.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.commit_state.lock().next_lsn)
    }

    /// Registers a new data file inside `op`. The file appears on disk when
    /// `op` commits.
    pub fn add_file(&self, op: &AtomicOperation, name: &str) -> Result<FileId> {
        validate_file_name(name)?;
        let exists = self.manifest.lock().lookup(name).is_some();
        if exists || op.new_file_named(name).is_some() {
            return Err(RidbagError::InvalidOwned(format!(
                "file {name:?} already exists"
            )));
        }
        let id = FileId(self.next_file_id.fetch_add(1, AtomicOrdering::SeqCst));
        op.register_new_file(id, name.to_owned());
        op.set_filled_up_to(id, 0);
        debug!(op = op.id(), file = id.0, name, "pager.add_file");
        Ok(id)
    }

    /// Resolves a file name, including files created earlier in `op`.
    pub fn open_file(&self, op: Option<&AtomicOperation>, name: &str) -> Result<FileId> {
        if let Some(id) = op.and_then(|op| op.new_file_named(name)) {
            return Ok(id);
        }
        let id = self
            .manifest
            .lock()
            .lookup(name)
            .ok_or(RidbagError::NotFound)?;
        if op.is_some_and(|op| op.is_deleted(id)) {
            return Err(RidbagError::NotFound);
        }
        Ok(id)
    }

    /// Schedules removal of a file when `op` commits.
    pub fn delete_file(&self, op: &AtomicOperation, id: FileId) -> Result<()> {
        if op.is_new_file(id) {
            op.discard_new_file(id);
            return Ok(());
        }
        if !self.files.read().contains_key(&id) {
            return Err(RidbagError::NotFound);
        }
        op.mark_deleted(id);
        Ok(())
    }

    /// Number of pages in `file` as seen by `op` (or by committed state).
    pub fn filled_up_to(&self, op: Option<&AtomicOperation>, file: FileId) -> Result<u64> {
        if let Some(op) = op {
            if op.is_deleted(file) {
                return Err(RidbagError::NotFound);
            }
            if let Some(filled) = op.filled_up_to(file) {
                return Ok(filled);
            }
        }
        Ok(self
            .file_handle(file)?
            .filled_up_to
            .load(AtomicOrdering::SeqCst))
    }

    /// Appends a zeroed page to `file` inside `op`.
    pub fn add_page(&self, op: &AtomicOperation, file: FileId) -> Result<PageMut> {
        let index = self.filled_up_to(Some(op), file)?;
        op.set_filled_up_to(file, index + 1);
        let id = PageId(index);
        let shadow = op.insert_shadow((file, id), vec![0u8; self.page_size].into_boxed_slice());
        Ok(PageMut {
            id,
            guard: shadow.lock_arc(),
        })
    }

    /// Pins a page for reading. Pages already written by `op` are read from
    /// its private copy.
    pub fn load_page_for_read(
        &self,
        op: Option<&AtomicOperation>,
        file: FileId,
        page_id: PageId,
    ) -> Result<PageRef> {
        let key = (file, page_id);
        if let Some(shadow) = op.and_then(|op| op.shadow(&key)) {
            return Ok(PageRef {
                id: page_id,
                inner: PageRefInner::Private(shadow.lock_arc()),
            });
        }
        self.check_bounds(op, file, page_id)?;
        let frame = self.lookup_or_load_frame(key)?;
        let pin = PinGuard::adopt(Arc::clone(&frame));
        let guard = frame.buf.read_arc();
        Ok(PageRef {
            id: page_id,
            inner: PageRefInner::Cached { guard, _pin: pin },
        })
    }

    /// Opens a page for writing inside `op`, copying the committed image on
    /// first access.
    pub fn load_page_for_write(
        &self,
        op: &AtomicOperation,
        file: FileId,
        page_id: PageId,
    ) -> Result<PageMut> {
        let key = (file, page_id);
        self.check_bounds(Some(op), file, page_id)?;
        let shadow = op.shadow_or_insert_with(key, || {
            let frame = self.lookup_or_load_frame(key)?;
            let _pin = PinGuard::adopt(Arc::clone(&frame));
            let image = frame.buf.read().clone();
            Ok(image)
        })?;
        Ok(PageMut {
            id: page_id,
            guard: shadow.lock_arc(),
        })
    }

    fn check_bounds(&self, op: Option<&AtomicOperation>, file: FileId, page_id: PageId) -> Result<()> {
        if page_id.0 >= self.filled_up_to(op, file)? {
            return Err(RidbagError::InvalidOwned(format!(
                "page {} beyond end of file {}",
                page_id.0, file.0
            )));
        }
        Ok(())
    }

    fn file_handle(&self, file: FileId) -> Result<Arc<FileHandle>> {
        self.files
            .read()
            .get(&file)
            .cloned()
            .ok_or(RidbagError::NotFound)
    }

    /// Returns a pinned frame for `key`, reading it from disk on a miss.
    fn lookup_or_load_frame(&self, key: PageKey) -> Result<Arc<Frame>> {
        let mut cache = self.cache.lock();
        if let Some(frame) = cache.get(&key) {
            frame.pin();
            PagerCounters::bump(&self.counters.hits);
            return Ok(Arc::clone(frame));
        }
        PagerCounters::bump(&self.counters.misses);
        self.evict_if_needed(&mut cache)?;
        let handle = self.file_handle(key.0)?;
        let frame = Arc::new(Frame::new(self.page_size));
        {
            let mut buf = frame.buf.write();
            self.read_page(&handle, key.1, &mut buf)?;
        }
        frame.pin();
        cache.put(key, Arc::clone(&frame));
        Ok(frame)
    }

    fn read_page(&self, handle: &FileHandle, page_id: PageId, dst: &mut [u8]) -> Result<()> {
        let offset = page_id.0 * self.page_size as u64;
        if offset + self.page_size as u64 > handle.io.len()? {
            // Committed but not yet checkpointed pages live only in the cache
            // and the WAL; the data file has never seen this page.
            dst.fill(0);
            return Ok(());
        }
        handle.io.read_at(offset, dst)?;
        if self.options.checksum_verify_on_read && page::is_formatted(dst) {
            page::verify(dst, page_id)?;
        }
        Ok(())
    }

    fn evict_if_needed(&self, cache: &mut LruCache<PageKey, Arc<Frame>>) -> Result<()> {
        while cache.len() >= self.options.cache_pages {
            let victim = cache
                .iter()
                .rev()
                .find(|(_, frame)| frame.pins() == 0)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                break;
            };
            if let Some(frame) = cache.pop(&key) {
                if frame.is_dirty() {
                    self.write_back(key, &frame)?;
                }
                PagerCounters::bump(&self.counters.evictions);
            }
        }
        Ok(())
    }

    fn write_back(&self, key: PageKey, frame: &Frame) -> Result<()> {
        if self.wal_dirty.swap(false, AtomicOrdering::SeqCst) {
            // Data pages never reach disk ahead of the log records that
            // describe them.
            if let Err(err) = self.wal.sync() {
                self.wal_dirty.store(true, AtomicOrdering::SeqCst);
                return Err(err);
            }
        }
        let Ok(handle) = self.file_handle(key.0) else {
            frame.clear_dirty();
            return Ok(());
        };
        let buf = frame.buf.read();
        handle
            .io
            .write_at(key.1 .0 * self.page_size as u64, &buf)?;
        frame.clear_dirty();
        PagerCounters::bump(&self.counters.writebacks);
        Ok(())
    }

    /// Stamps, logs, and installs every page written by `op` under one LSN.
    pub(crate) fn commit(&self, op: &AtomicOperation) -> Result<Lsn> {
        let mut state = self.commit_state.lock();
        let mut lsn = Lsn(state.next_lsn);
        let deleted = op.deleted_files();
        let new_files = op.new_files();
        let mut pages = op.take_shadows();
        pages.retain(|(key, _)| !deleted.contains(&key.0));
        for ((_, page_id), image) in pages.iter_mut() {
            page::stamp(image, *page_id, lsn)?;
        }
        debug!(
            op = op.id(),
            lsn = lsn.0,
            pages = pages.len(),
            new_files = new_files.len(),
            deleted_files = deleted.len(),
            "pager.commit.start"
        );

        let mut created: Vec<(FileId, Arc<FileHandle>, PathBuf)> = Vec::new();
        for (id, name) in &new_files {
            let path = data_file_path(&self.dir, name);
            match StdFileIo::open(&path).and_then(|io| io.truncate(0).map(|()| io)) {
                Ok(io) => created.push((
                    *id,
                    Arc::new(FileHandle {
                        io: Arc::new(io),
                        filled_up_to: AtomicU64::new(0),
                    }),
                    path,
                )),
                Err(err) => {
                    remove_created(&created);
                    return Err(err);
                }
            }
        }

        let file_changes: Vec<WalFileChange<'_>> = new_files
            .iter()
            .map(|(id, name)| WalFileChange::Added {
                file_id: *id,
                name: name.as_str(),
            })
            .chain(
                deleted
                    .iter()
                    .map(|id| WalFileChange::Dropped { file_id: *id }),
            )
            .collect();
        if !pages.is_empty() || !file_changes.is_empty() {
            let wal_pages: Vec<WalPage<'_>> = pages
                .iter()
                .map(|((file_id, page_id), image)| WalPage {
                    file_id: *file_id,
                    page_id: *page_id,
                    payload: image,
                })
                .collect();
            let logged = self
                .wal
                .append_commit_group_with_files(lsn, &file_changes, &wal_pages)
                .and_then(|()| match self.options.synchronous {
                    Synchronous::Full => self.wal.sync(),
                    // The manifest is about to change; its log records must
                    // be durable first.
                    Synchronous::Normal if !file_changes.is_empty() => self.wal.sync(),
                    Synchronous::Normal => {
                        self.wal_dirty.store(true, AtomicOrdering::SeqCst);
                        Ok(())
                    }
                    Synchronous::Off => Ok(()),
                });
            if let Err(err) = logged {
                remove_created(&created);
                return Err(err);
            }
            state.next_lsn += 1;
            state.frames_since_checkpoint += pages.len() as u64;
        } else {
            lsn = Lsn(state.next_lsn - 1);
        }

        if !created.is_empty() || !deleted.is_empty() {
            self.apply_file_changes(&new_files, created, &deleted)?;
        }

        for (key, image) in pages {
            self.install(key, image)?;
        }
        {
            let files = self.files.read();
            for (file, filled) in op.filled_snapshot() {
                if let Some(handle) = files.get(&file) {
                    handle.filled_up_to.fetch_max(filled, AtomicOrdering::SeqCst);
                }
            }
        }
        PagerCounters::bump(&self.counters.commits);
        let checkpoint_due = self.options.autocheckpoint_frames > 0
            && state.frames_since_checkpoint >= self.options.autocheckpoint_frames;
        drop(state);
        if checkpoint_due {
            self.checkpoint()?;
        }
        Ok(lsn)
    }

    fn apply_file_changes(
        &self,
        new_files: &[(FileId, String)],
        created: Vec<(FileId, Arc<FileHandle>, PathBuf)>,
        deleted: &[FileId],
    ) -> Result<()> {
        if !deleted.is_empty() {
            let mut cache = self.cache.lock();
            let doomed: Vec<PageKey> = cache
                .iter()
                .filter(|(key, _)| deleted.contains(&key.0))
                .map(|(key, _)| *key)
                .collect();
            for key in doomed {
                cache.pop(&key);
            }
        }
        let mut removed_names = Vec::new();
        {
            let mut files = self.files.write();
            for (id, handle, _) in created {
                files.insert(id, handle);
            }
            for id in deleted {
                files.remove(id);
            }
        }
        let snapshot = {
            let mut manifest = self.manifest.lock();
            for (id, name) in new_files {
                manifest.files.push(ManifestFile {
                    id: id.0,
                    name: name.clone(),
                });
            }
            manifest.files.retain(|file| {
                let doomed = deleted.contains(&FileId(file.id));
                if doomed {
                    removed_names.push(file.name.clone());
                }
                !doomed
            });
            manifest.next_file_id = manifest
                .next_file_id
                .max(self.next_file_id.load(AtomicOrdering::SeqCst));
            manifest.clone()
        };
        write_manifest(&self.dir, &snapshot)?;
        for name in removed_names {
            let path = data_file_path(&self.dir, &name);
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "pager.delete_file.unlink_failed");
            }
        }
        Ok(())
    }

    fn install(&self, key: PageKey, image: Box<[u8]>) -> Result<()> {
        let mut cache = self.cache.lock();
        if let Some(frame) = cache.get(&key).map(Arc::clone) {
            // Pinned before the cache lock is released so eviction cannot
            // drop the frame while the new image is swapped in.
            frame.pin();
            let _pin = PinGuard::adopt(Arc::clone(&frame));
            drop(cache);
            *frame.buf.write() = image;
            frame.mark_dirty();
            return Ok(());
        }
        self.evict_if_needed(&mut cache)?;
        cache.put(key, Arc::new(Frame::from_image(image, true)));
        Ok(())
    }

    /// Writes every dirty cached page to its data file, syncs the files, and
    /// truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.commit_state.lock();
        let dirty: Vec<(PageKey, Arc<Frame>)> = self
            .cache
            .lock()
            .iter()
            .filter(|(_, frame)| frame.is_dirty())
            .map(|(key, frame)| (*key, Arc::clone(frame)))
            .collect();
        for (key, frame) in &dirty {
            self.write_back(*key, frame)?;
        }
        let handles: Vec<Arc<FileHandle>> = self.files.read().values().cloned().collect();
        for handle in handles {
            handle.io.sync_all()?;
        }
        self.wal.reset(Lsn(state.next_lsn))?;
        self.wal_dirty.store(false, AtomicOrdering::SeqCst);
        state.frames_since_checkpoint = 0;
        PagerCounters::bump(&self.counters.checkpoints);
        info!(pages = dirty.len(), next_lsn = state.next_lsn, "pager.checkpoint");
        Ok(())
    }
}

fn remove_created(created: &[(FileId, Arc<FileHandle>, PathBuf)]) {
    for (_, _, path) in created {
        let _ = fs::remove_file(path);
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(err) = self.checkpoint() {
            warn!(error = %err, "pager.drop.checkpoint_failed");
        }
    }
}
