use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One cached page image shared by readers and the committer.
pub(crate) struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self::from_image(vec![0u8; page_size].into_boxed_slice(), false)
    }

    pub fn from_image(image: Box<[u8]>, dirty: bool) -> Self {
        Self {
            buf: Arc::new(RwLock::new(image)),
            dirty: AtomicBool::new(dirty),
            pins: AtomicU32::new(0),
        }
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// Keeps a frame resident until dropped.
pub(crate) struct PinGuard(Arc<Frame>);

impl PinGuard {
    /// Takes ownership of a pin already counted on `frame`.
    pub fn adopt(frame: Arc<Frame>) -> Self {
        Self(frame)
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.0.pins.fetch_sub(1, Ordering::SeqCst);
    }
}
