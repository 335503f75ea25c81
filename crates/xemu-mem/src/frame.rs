use crate::error::VmmError;
use crate::{page_ceil, PAGE_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) const PAGE_BYTES: usize = PAGE_SIZE as usize;

pub(crate) type FrameBytes = Box<[u8; PAGE_BYTES]>;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Host storage behind one guest page.
///
/// Storage is allocated on first store; until then the frame reads as zeros.
/// `version` is bumped (Release) while the write lock is still held, so a
/// reader that samples it under the read lock sees a version that matches the
/// bytes it copies.
#[derive(Debug)]
pub(crate) struct PageFrame {
    id: u64,
    version: AtomicU64,
    data: RwLock<Option<FrameBytes>>,
}

impl PageFrame {
    pub(crate) fn zeroed() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            version: AtomicU64::new(0),
            data: RwLock::new(None),
        })
    }

    /// Frame initialised from `bytes` (shorter input is zero-padded).
    pub(crate) fn with_contents(bytes: &[u8]) -> Arc<Self> {
        if bytes.iter().all(|&b| b == 0) {
            return Self::zeroed();
        }
        let mut page = zero_page();
        let n = bytes.len().min(PAGE_BYTES);
        page[..n].copy_from_slice(&bytes[..n]);
        Arc::new(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            version: AtomicU64::new(0),
            data: RwLock::new(Some(page)),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn lock_read(&self) -> RwLockReadGuard<'_, Option<FrameBytes>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_write(&self) -> RwLockWriteGuard<'_, Option<FrameBytes>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the write guard held.
    #[inline]
    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Copy `dst.len()` bytes starting at `offset`; returns the version the
    /// bytes belong to.
    pub(crate) fn read_into(&self, offset: usize, dst: &mut [u8]) -> u64 {
        let guard = self.lock_read();
        let version = self.version();
        match guard.as_ref() {
            Some(page) => dst.copy_from_slice(&page[offset..offset + dst.len()]),
            None => dst.fill(0),
        }
        version
    }

    pub(crate) fn write_from(&self, offset: usize, src: &[u8]) {
        let mut guard = self.lock_write();
        let page = guard.get_or_insert_with(zero_page);
        page[offset..offset + src.len()].copy_from_slice(src);
        self.bump_version();
    }
}

#[inline]
pub(crate) fn zero_page() -> FrameBytes {
    Box::new([0u8; PAGE_BYTES])
}

/// A set of frames that can be mapped at more than one guest address.
///
/// Stores through any mapping are visible through every other mapping, and
/// since versions live on the frames, self-modifying-code tracking follows
/// the alias too.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    frames: Arc<[Arc<PageFrame>]>,
}

impl SharedMemory {
    pub fn new(len: u64) -> Result<Self, VmmError> {
        let rounded = page_ceil(len)
            .filter(|&l| l != 0)
            .ok_or(VmmError::InvalidLength { start: 0, len })?;
        let pages = rounded / PAGE_SIZE;
        let frames: Vec<Arc<PageFrame>> = (0..pages).map(|_| PageFrame::zeroed()).collect();
        Ok(Self {
            frames: frames.into(),
        })
    }

    pub fn len(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn frame(&self, index: usize) -> Option<&Arc<PageFrame>> {
        self.frames.get(index)
    }
}
