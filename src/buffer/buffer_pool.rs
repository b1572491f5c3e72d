use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::page::{AtomicPageId, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::config::BufferPoolConfig;
use crate::error::{CorvusError, CorvusResult};
use crate::storage::disk_scheduler::DiskScheduler;

pub type FrameId = usize;

#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// Owns the frame arena and the mapping tables. Replacement policy and
/// pinning live one layer up in `BufferPoolManager`; this type only knows how
/// to address frames, move pages between frames and disk, and hand out ids.
#[derive(Debug)]
pub struct BufferPool {
    arena: Box<[UnsafeCell<u8>]>,
    locks: Vec<RwLock<()>>,
    meta: Vec<Mutex<FrameMeta>>,
    page_table: DashMap<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    next_page_id: AtomicPageId,
    disk_scheduler: Arc<DiskScheduler>,
}

// The raw arena is only ever touched through a frame's rw-latch.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let num_pages = config.buffer_pool_size;
        let mut free_list = VecDeque::with_capacity(num_pages);
        let mut meta = Vec::with_capacity(num_pages);
        let mut locks = Vec::with_capacity(num_pages);
        for frame_id in 0..num_pages {
            free_list.push_back(frame_id);
            meta.push(Mutex::new(FrameMeta::default()));
            locks.push(RwLock::new(()));
        }

        let mut arena_vec: Vec<UnsafeCell<u8>> = Vec::with_capacity(num_pages * PAGE_SIZE);
        arena_vec.resize_with(num_pages * PAGE_SIZE, || UnsafeCell::new(0u8));

        Self {
            arena: arena_vec.into_boxed_slice(),
            locks,
            meta,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            next_page_id: AtomicPageId::new(config.first_page_id),
            disk_scheduler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.locks.len()
    }

    pub fn allocate_page_id(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.locks[frame_id]
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.meta[frame_id].lock()
    }

    /// # Safety
    /// The caller must hold the frame's latch (shared or exclusive).
    pub unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        let ptr = self.frame_ptr(frame_id) as *const u8;
        std::slice::from_raw_parts(ptr, PAGE_SIZE)
    }

    /// # Safety
    /// The caller must hold the frame's latch exclusively.
    pub unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        let ptr = self.frame_ptr(frame_id);
        std::slice::from_raw_parts_mut(ptr, PAGE_SIZE)
    }

    unsafe fn frame_ptr(&self, frame_id: FrameId) -> *mut u8 {
        debug_assert!(frame_id < self.capacity());
        self.arena.as_ptr().add(frame_id * PAGE_SIZE) as *mut u8
    }

    pub fn lookup_frame(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.get(&page_id).map(|entry| *entry.value())
    }

    pub fn insert_mapping(&self, page_id: PageId, frame_id: FrameId) {
        self.page_table.insert(page_id, frame_id);
    }

    pub fn remove_mapping(&self, page_id: PageId) {
        self.page_table.remove(&page_id);
    }

    pub fn mapped_page_ids(&self) -> Vec<PageId> {
        self.page_table.iter().map(|entry| *entry.key()).collect()
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn load_page_into_frame(&self, page_id: PageId, frame_id: FrameId) -> CorvusResult<()> {
        let page_bytes = self.read_page_from_disk(page_id)?;
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        let len = PAGE_SIZE.min(page_bytes.len());
        slice[..len].copy_from_slice(&page_bytes[..len]);
        if len < PAGE_SIZE {
            slice[len..].fill(0);
        }
        Ok(())
    }

    pub fn write_page_to_disk(&self, page_id: PageId, bytes: Bytes) -> CorvusResult<()> {
        self.disk_scheduler
            .schedule_write(page_id, bytes)?
            .recv()
            .map_err(|e| CorvusError::Internal(format!("Channel disconnected: {}", e)))??;
        Ok(())
    }

    pub fn read_page_from_disk(&self, page_id: PageId) -> CorvusResult<BytesMut> {
        let rx = self.disk_scheduler.schedule_read(page_id)?;
        rx.recv()
            .map_err(|e| CorvusError::Internal(format!("Channel disconnected: {}", e)))?
    }

    /// Zero the frame payload and reset its metadata.
    pub fn reset_frame(&self, frame_id: FrameId) {
        unsafe {
            self.frame_slice_mut(frame_id).fill(0);
        }
        *self.meta[frame_id].lock() = FrameMeta::default();
    }

    pub fn disk_scheduler(&self) -> Arc<DiskScheduler> {
        self.disk_scheduler.clone()
    }
}
