//! RAII guards coupling the buffer pool's pin discipline with page latches.
//!
//! Every guard holds one pin on its frame and gives it back on drop. The
//! latched variants additionally hold the frame's reader/writer latch for
//! their whole lifetime and release it just before unpinning. Guards are
//! move-only values; reassigning one releases whatever it held first.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::ops::{Deref, DerefMut};

use crate::buffer_pool::BufferPoolManager;
use crate::{FrameId, Page, PageId};

/// A pinned page without a latch. Data access goes through the on-demand
/// [`read`](Self::read) / [`write`](Self::write) accessors; `write` marks
/// the guard dirty, and the dirty flag is handed to the unpin on drop.
pub struct BasicPageGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    is_dirty: bool,
}

impl<'a> std::fmt::Debug for BasicPageGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicPageGuard")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id)
            .field("is_dirty", &self.is_dirty)
            .finish()
    }
}

impl<'a> BasicPageGuard<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, frame_id: FrameId, page_id: PageId) -> Self {
        Self {
            bpm,
            frame_id,
            page_id,
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.bpm.frame_latch(self.frame_id).read()
    }

    pub fn write(&mut self) -> RwLockWriteGuard<'_, Page> {
        self.is_dirty = true;
        self.bpm.frame_latch(self.frame_id).write()
    }
}

impl Drop for BasicPageGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}

/// A pinned page holding the shared latch. Dereferences to [`Page`].
pub struct ReadPageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    latch: Option<RwLockReadGuard<'a, Page>>,
}

impl<'a> ReadPageGuard<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, frame_id: FrameId, page_id: PageId) -> Self {
        let latch = bpm.frame_latch(frame_id).read();
        Self {
            bpm,
            page_id,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for ReadPageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.latch.as_ref().expect("page guard already released")
    }
}

impl Drop for ReadPageGuard<'_> {
    fn drop(&mut self) {
        // Latch first, pin second.
        self.latch.take();
        self.bpm.unpin_page(self.page_id, false);
    }
}

/// A pinned page holding the exclusive latch. Mutable dereference marks the
/// guard dirty, so any mutation is written back before the frame is reused.
pub struct WritePageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    latch: Option<RwLockWriteGuard<'a, Page>>,
    is_dirty: bool,
}

impl<'a> WritePageGuard<'a> {
    pub(crate) fn new(bpm: &'a BufferPoolManager, frame_id: FrameId, page_id: PageId) -> Self {
        let latch = bpm.frame_latch(frame_id).write();
        Self {
            bpm,
            page_id,
            latch: Some(latch),
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for WritePageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.latch.as_ref().expect("page guard already released")
    }
}

impl DerefMut for WritePageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        self.is_dirty = true;
        self.latch.as_mut().expect("page guard already released")
    }
}

impl Drop for WritePageGuard<'_> {
    fn drop(&mut self) {
        self.latch.take();
        self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}
