use std::mem::{self, ManuallyDrop};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use super::buffer_manager::BufferPoolManager;
use super::buffer_pool::{BufferPool, FrameId, FrameMeta};

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// Shared handle to a pinned frame. Holds the frame's rw-latch for its whole
/// lifetime; dropping it releases the latch first and then gives the pin
/// back to the pool.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl ReadPageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(self.page_id) {
            log::error!("Failed to unpin page {}: {}", self.page_id, e);
        }
    }
}

/// Exclusive handle to a pinned frame. Any access to `data_mut` marks the
/// frame dirty, so the write-back rule (dirty before release) holds no matter
/// how the guard is used.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
}

impl WritePageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.mark_dirty();
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    /// Replace the whole payload in one shot.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data_mut().copy_from_slice(data);
    }

    pub fn mark_dirty(&mut self) {
        self.pool.frame_meta(self.frame_id).is_dirty = true;
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(self.page_id) {
            log::error!("Failed to unpin page {}: {}", self.page_id, e);
        }
    }
}

pub(crate) fn new_read_guard(
    bpm: Arc<BufferPoolManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> ReadPageGuard {
    let pool = bpm.buffer_pool();
    let guard = pool.frame_lock(frame_id).read();
    // The latch lives as long as the pool; the guard keeps the pool alive
    // through its own Arc, so extending the borrow is sound.
    let guard_static: RwLockReadGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(guard) };
    ReadPageGuard {
        bpm,
        pool,
        frame_id,
        page_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

pub(crate) fn new_write_guard(
    bpm: Arc<BufferPoolManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> WritePageGuard {
    let pool = bpm.buffer_pool();
    let guard = pool.frame_lock(frame_id).write();
    let guard_static: RwLockWriteGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(guard) };
    WritePageGuard {
        bpm,
        pool,
        frame_id,
        page_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::MemoryDiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;

    fn setup_bpm(num_pages: usize) -> Arc<BufferPoolManager> {
        let disk_manager = Arc::new(MemoryDiskManager::new());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        Arc::new(BufferPoolManager::new(num_pages, disk_scheduler))
    }

    #[test]
    fn read_guard_pins_and_unpins_frame() {
        let bpm = setup_bpm(4);
        let page_id = bpm.new_page().unwrap();

        let read_guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(read_guard.pin_count(), 1);
        assert_eq!(read_guard.page_id(), page_id);
        let frame_id = read_guard.frame_id();
        drop(read_guard);

        assert_eq!(bpm.buffer_pool().frame_meta(frame_id).pin_count, 0);
    }

    #[test]
    fn write_guard_marks_dirty_on_mutation() {
        let bpm = setup_bpm(4);
        let page_id = bpm.new_page().unwrap();

        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        assert!(!guard.is_dirty());
        guard.data_mut()[0] = 9;
        assert!(guard.is_dirty());
        drop(guard);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 9);
    }

    #[test]
    fn multiple_readers_share_a_frame() {
        let bpm = setup_bpm(4);
        let page_id = bpm.new_page().unwrap();

        let g1 = bpm.fetch_page_read(page_id).unwrap();
        let g2 = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(g1.frame_id(), g2.frame_id());
        assert_eq!(g2.pin_count(), 2);
    }
}
