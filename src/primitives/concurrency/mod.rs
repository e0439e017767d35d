#![forbid(unsafe_code)]
//! In-process readers-writer locks used by components and the atomic
//! operation manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct LockSnapshot {
    /// Number of active shared holders.
    pub readers: u32,
    /// Whether the exclusive lock is held.
    pub writer: bool,
}

/// Non-reentrant shared/exclusive lock guarding one component.
///
/// Readers take [`SharedExclusiveLock::shared`], writers take
/// [`SharedExclusiveLock::exclusive`]. Guards release on drop, so every
/// early return and error path unlocks.
#[derive(Default)]
pub struct SharedExclusiveLock {
    lock: RwLock<()>,
    readers: AtomicU32,
    writer: AtomicBool,
}

/// Guard for a held shared lock.
pub struct SharedGuard<'a> {
    owner: &'a SharedExclusiveLock,
    _guard: RwLockReadGuard<'a, ()>,
}

/// Guard for a held exclusive lock.
pub struct ExclusiveGuard<'a> {
    owner: &'a SharedExclusiveLock,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl SharedExclusiveLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is held in shared mode.
    pub fn shared(&self) -> SharedGuard<'_> {
        let guard = self.lock.read();
        self.readers.fetch_add(1, Ordering::Relaxed);
        SharedGuard {
            owner: self,
            _guard: guard,
        }
    }

    /// Blocks until the lock is held exclusively.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        let guard = self.lock.write();
        self.writer.store(true, Ordering::Relaxed);
        ExclusiveGuard {
            owner: self,
            _guard: guard,
        }
    }

    /// Returns a snapshot of the current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            readers: self.readers.load(Ordering::Relaxed),
            writer: self.writer.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.owner.readers.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.owner.writer.store(false, Ordering::Relaxed);
    }
}

/// Owned shared hold on a named component lock.
pub type ComponentReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Owned exclusive hold on a named component lock.
pub type ComponentWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Registry of per-component readers-writer locks, created on first use.
#[derive(Default)]
pub struct ComponentLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl ComponentLocks {
    fn lock_for(&self, component: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(component.to_owned())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Blocks until `component` is held in shared mode.
    pub fn read(&self, component: &str) -> ComponentReadGuard {
        self.lock_for(component).read_arc()
    }

    /// Blocks until `component` is held exclusively.
    pub fn write(&self, component: &str) -> ComponentWriteGuard {
        self.lock_for(component).write_arc()
    }

    /// Returns true when a writer currently holds `component`.
    pub fn is_write_locked(&self, component: &str) -> bool {
        self.locks
            .lock()
            .get(component)
            .map(|lock| lock.is_locked_exclusive())
            .unwrap_or(false)
    }
}
