//! The buffer pool manager: a fixed set of in-memory frames caching disk
//! pages, with LRU-K replacement and guard-based pin/latch discipline.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex};

use crate::page_guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::pager::Pager;
use crate::replacer::LruKReplacer;
use crate::wal::{WalManager, WalRecord};
use crate::{lock_mutex_recover, FrameId, Page, PageId, INVALID_PAGE_ID};

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,

    /// The k of the LRU-K replacement policy.
    pub replacer_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            replacer_k: 2,
        }
    }
}

#[derive(Debug)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn vacant() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// Bookkeeping covered by the manager mutex: the page table, the free list
/// and the per-frame metadata. Page *contents* are covered by the per-frame
/// latches instead, so the mutex is never held across disk I/O on the miss
/// path.
struct BpmState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    meta: Vec<FrameMeta>,
    /// Pages whose eviction write-back is still in flight. Such a page is
    /// neither resident nor safely readable from disk yet; fetches of it
    /// wait on `flush_cv` until the image lands.
    flushing: HashSet<PageId>,
}

pub struct BufferPoolManager {
    pub pager: Mutex<Pager>,
    frames: Vec<RwLock<Page>>,
    state: Mutex<BpmState>,
    flush_cv: Condvar,
    replacer: LruKReplacer,
    wal: Option<Mutex<WalManager>>,
}

impl BufferPoolManager {
    pub fn new(pager: Pager, config: BufferPoolConfig) -> Self {
        Self::build(pager, config, None)
    }

    /// A buffer pool that appends every dirty page image to `wal` before
    /// writing it back.
    pub fn new_with_wal(pager: Pager, config: BufferPoolConfig, wal: WalManager) -> Self {
        Self::build(pager, config, Some(wal))
    }

    fn build(pager: Pager, config: BufferPoolConfig, wal: Option<WalManager>) -> Self {
        let mut frames = Vec::with_capacity(config.pool_size);
        let mut meta = Vec::with_capacity(config.pool_size);
        let mut free_list = VecDeque::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            frames.push(RwLock::new(Page::new(INVALID_PAGE_ID)));
            meta.push(FrameMeta::vacant());
            free_list.push_back(i);
        }

        Self {
            pager: Mutex::new(pager),
            frames,
            state: Mutex::new(BpmState {
                page_table: HashMap::with_capacity(config.pool_size),
                free_list,
                meta,
                flushing: HashSet::new(),
            }),
            flush_cv: Condvar::new(),
            replacer: LruKReplacer::new(config.pool_size, config.replacer_k),
            wal: wal.map(Mutex::new),
        }
    }

    /// Allocates a fresh page id, installs a zeroed page for it and returns
    /// it pinned. Fails when every frame is pinned.
    pub fn new_page(&self) -> io::Result<BasicPageGuard<'_>> {
        let (frame_id, victim) = self.reserve_frame()?;
        let page_id = match lock_mutex_recover(&self.pager).allocate_page() {
            Ok(id) => id,
            Err(e) => {
                self.unreserve(frame_id, victim);
                return Err(e);
            }
        };
        self.fault_in(frame_id, victim, page_id, true)?;
        crate::granite_debug_log!("[BufferPoolManager::new_page] page {page_id} in frame {frame_id}");
        Ok(BasicPageGuard::new(self, frame_id, page_id))
    }

    /// Pins `page_id` without latching it.
    pub fn fetch_page_basic(&self, page_id: PageId) -> io::Result<BasicPageGuard<'_>> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(BasicPageGuard::new(self, frame_id, page_id))
    }

    /// Pins `page_id` and takes the shared latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> io::Result<ReadPageGuard<'_>> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(ReadPageGuard::new(self, frame_id, page_id))
    }

    /// Pins `page_id` and takes the exclusive latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> io::Result<WritePageGuard<'_>> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(WritePageGuard::new(self, frame_id, page_id))
    }

    /// Gives back one pin. Returns false when the page is not resident or
    /// its pin count is already zero. The dirty flag is OR-assigned: an
    /// unpin with `false` never clears an earlier writer's mark.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = lock_mutex_recover(&self.state);
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut state.meta[frame_id];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes the page to disk unconditionally and clears its dirty flag.
    /// Returns `Ok(false)` when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> io::Result<bool> {
        let (frame_id, was_dirty) = {
            let mut state = lock_mutex_recover(&self.state);
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            // Clear before copying: a writer racing past the copy re-marks
            // the frame and the next write-back picks its changes up.
            let was_dirty = state.meta[frame_id].is_dirty;
            state.meta[frame_id].is_dirty = false;
            state.meta[frame_id].pin_count += 1;
            self.replacer.set_evictable(frame_id, false);
            (frame_id, was_dirty)
        };

        let result = {
            let frame = self.frames[frame_id].read();
            self.write_back(&frame)
        };

        let mut state = lock_mutex_recover(&self.state);
        if result.is_err() && was_dirty {
            state.meta[frame_id].is_dirty = true;
        }
        state.meta[frame_id].pin_count -= 1;
        if state.meta[frame_id].pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        result.map(|_| true)
    }

    /// Flushes every resident page, then logs a checkpoint when a log hook
    /// is configured.
    pub fn flush_all_pages(&self) -> io::Result<()> {
        let resident: Vec<PageId> = {
            let state = lock_mutex_recover(&self.state);
            state.page_table.keys().copied().collect()
        };
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        if let Some(wal) = &self.wal {
            lock_mutex_recover(wal).log(&WalRecord::Checkpoint)?;
        }
        Ok(())
    }

    /// Drops a page from the pool, flushing it first if dirty. Returns
    /// `Ok(true)` for non-resident pages (deleting is idempotent) and
    /// `Ok(false)` when the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> io::Result<bool> {
        let mut state = lock_mutex_recover(&self.state);
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.meta[frame_id].pin_count > 0 {
            return Ok(false);
        }
        if state.meta[frame_id].is_dirty {
            // pin_count == 0 means no guard holds this latch.
            let frame = self.frames[frame_id].read();
            self.write_back(&frame)?;
        }
        state.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        state.meta[frame_id] = FrameMeta::vacant();
        *self.frames[frame_id].write() = Page::new(INVALID_PAGE_ID);
        state.free_list.push_back(frame_id);
        lock_mutex_recover(&self.pager).deallocate_page(page_id);
        Ok(true)
    }

    pub(crate) fn frame_latch(&self, frame_id: FrameId) -> &RwLock<Page> {
        &self.frames[frame_id]
    }

    fn fetch_frame(&self, page_id: PageId) -> io::Result<FrameId> {
        {
            let mut state = lock_mutex_recover(&self.state);
            while state.flushing.contains(&page_id) {
                state = self
                    .flush_cv
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                state.meta[frame_id].pin_count += 1;
                self.replacer.record_access_and_set_evictable(frame_id, false);
                return Ok(frame_id);
            }
        }
        crate::granite_debug_log!("[BufferPoolManager] page {page_id} miss, loading from disk");
        let (frame_id, victim) = self.reserve_frame()?;
        self.fault_in(frame_id, victim, page_id, false)?;
        Ok(frame_id)
    }

    /// Takes a frame off the free list, or evicts one. The returned frame is
    /// pinned, holds no page-table entry and has no replacer node: until it
    /// is published (or unreserved) it belongs to the calling thread alone,
    /// which is what lets the caller do disk I/O without the state mutex.
    /// Also returns the evicted page's `(page_id, is_dirty)` if any.
    fn reserve_frame(&self) -> io::Result<(FrameId, Option<(PageId, bool)>)> {
        let mut state = lock_mutex_recover(&self.state);
        if let Some(frame_id) = state.free_list.pop_front() {
            state.meta[frame_id] = FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 1,
                is_dirty: false,
            };
            return Ok((frame_id, None));
        }

        let Some(frame_id) = self.replacer.evict() else {
            return Err(io::Error::other("all pages are pinned"));
        };
        let victim = &state.meta[frame_id];
        assert_eq!(victim.pin_count, 0, "evicted a pinned frame");
        let old = (victim.page_id, victim.is_dirty);
        state.page_table.remove(&old.0);
        if old.1 {
            state.flushing.insert(old.0);
        }
        state.meta[frame_id] = FrameMeta {
            page_id: INVALID_PAGE_ID,
            pin_count: 1,
            is_dirty: false,
        };
        Ok((frame_id, Some(old)))
    }

    /// Undoes a reservation: a frame that came from the free list goes back
    /// there, an evicted victim is reinstated in the page table and the
    /// replacer.
    fn unreserve(&self, frame_id: FrameId, victim: Option<(PageId, bool)>) {
        let mut state = lock_mutex_recover(&self.state);
        match victim {
            Some((page_id, is_dirty)) => {
                state.flushing.remove(&page_id);
                state.meta[frame_id] = FrameMeta {
                    page_id,
                    pin_count: 0,
                    is_dirty,
                };
                state.page_table.insert(page_id, frame_id);
                self.replacer.record_access_and_set_evictable(frame_id, true);
            }
            None => {
                state.meta[frame_id] = FrameMeta::vacant();
                state.free_list.push_back(frame_id);
            }
        }
        drop(state);
        self.flush_cv.notify_all();
    }

    /// Fills a reserved frame with `target` (zeroed or read from disk) and
    /// publishes it in the page table. On failure the reservation is undone
    /// and the error propagates to the caller.
    fn fault_in(
        &self,
        frame_id: FrameId,
        victim: Option<(PageId, bool)>,
        target: PageId,
        zero_fill: bool,
    ) -> io::Result<()> {
        let mut victim = victim;
        if let Some((victim_page_id, true)) = victim {
            let flush_result = {
                let frame = self.frames[frame_id].read();
                self.write_back(&frame)
            };
            if let Err(e) = flush_result {
                self.unreserve(frame_id, Some((victim_page_id, true)));
                return Err(e);
            }
            {
                let mut state = lock_mutex_recover(&self.state);
                state.flushing.remove(&victim_page_id);
            }
            self.flush_cv.notify_all();
            victim = Some((victim_page_id, false));
        }

        if zero_fill {
            *self.frames[frame_id].write() = Page::new(target);
        } else {
            match lock_mutex_recover(&self.pager).read_page(target) {
                Ok(page) => *self.frames[frame_id].write() = page,
                Err(e) => {
                    // Frame contents are still the (already clean) victim's.
                    self.unreserve(frame_id, victim);
                    return Err(e);
                }
            }
        }

        let mut state = lock_mutex_recover(&self.state);
        state.meta[frame_id].page_id = target;
        state.page_table.insert(target, frame_id);
        self.replacer.record_access_and_set_evictable(frame_id, false);
        Ok(())
    }

    fn write_back(&self, image: &Page) -> io::Result<()> {
        if let Some(wal) = &self.wal {
            lock_mutex_recover(wal).log(&WalRecord::PageImage {
                page_id: image.id,
                data: image.data.to_vec(),
            })?;
        }
        lock_mutex_recover(&self.pager).write_page(image)
    }
}
