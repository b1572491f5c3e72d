use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::buffer::buffer_pool::{BufferPool, FrameId, FrameMeta};
use crate::buffer::page::{self, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::error::{CorvusError, CorvusResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::arc_replacer::ArcReplacer;
use crate::utils::cache::Replacer;

/// Coordinates pinning, replacement and write-back over a shared frame pool.
///
/// Lock order: a frame's meta mutex may be held while taking the replacer
/// mutex, never the other way around. Neither is held across a disk wait.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Arc<BufferPool>,
    replacer: Mutex<ArcReplacer>,
    // Serializes loads/evictions/deletes of the same page id so a reload can
    // never observe a half-written victim.
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferPoolManager {
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
        let pool = Arc::new(BufferPool::new_with_config(config, disk_scheduler));
        let replacer = Mutex::new(ArcReplacer::new(pool.capacity()));
        Self {
            pool,
            replacer,
            inflight_loads: DashMap::new(),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Allocate a fresh page id, bring it into a zeroed frame and leave it
    /// unpinned. Fails only when no frame can be freed.
    pub fn new_page(&self) -> CorvusResult<PageId> {
        let frame_id = self.allocate_frame()?;
        let page_id = self.pool.allocate_page_id();

        self.pool.reset_frame(frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 0;
            meta.is_dirty = false;
            self.pool.insert_mapping(page_id, frame_id);
            let mut rep = self.replacer.lock();
            let _ = rep.record_access(frame_id, page_id);
            let _ = rep.set_evictable(frame_id, meta.pin_count == 0);
        }
        Ok(page_id)
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> CorvusResult<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(CorvusError::Storage(
                "fetch_page_read: invalid page id".to_string(),
            ));
        }
        let frame_id = self.pin_frame(page_id)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id, page_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> CorvusResult<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(CorvusError::Storage(
                "fetch_page_write: invalid page id".to_string(),
            ));
        }
        let frame_id = self.pin_frame(page_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id, page_id))
    }

    /// `Ok(None)` exactly when the page is not resident and no frame can be
    /// made available.
    pub fn checked_read_page(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> CorvusResult<Option<ReadPageGuard>> {
        match self.fetch_page_read(page_id) {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.is_resource_exhausted() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn checked_write_page(
        self: &Arc<Self>,
        page_id: PageId,
    ) -> CorvusResult<Option<WritePageGuard>> {
        match self.fetch_page_write(page_id) {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.is_resource_exhausted() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Unchecked variant of `checked_read_page`; aborts when the pool cannot
    /// produce the page.
    pub fn read_page(self: &Arc<Self>, page_id: PageId) -> ReadPageGuard {
        self.fetch_page_read(page_id)
            .unwrap_or_else(|e| panic!("read_page({}) failed: {}", page_id, e))
    }

    /// Unchecked variant of `checked_write_page`; aborts when the pool cannot
    /// produce the page.
    pub fn write_page(self: &Arc<Self>, page_id: PageId) -> WritePageGuard {
        self.fetch_page_write(page_id)
            .unwrap_or_else(|e| panic!("write_page({}) failed: {}", page_id, e))
    }

    /// Give back one pin; the frame becomes a replacement candidate when the
    /// count reaches zero. Called from the guard destructors.
    pub(crate) fn complete_unpin(&self, page_id: PageId) -> CorvusResult<()> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id {
                return Ok(());
            }
            if meta.pin_count > 0 {
                meta.pin_count -= 1;
            }
            if meta.pin_count == 0 {
                let mut rep = self.replacer.lock();
                let _ = rep.set_evictable(frame_id, true);
            }
        }
        Ok(())
    }

    /// Write a resident dirty page back and clear its dirty bit. Returns
    /// true iff the page was resident.
    pub fn flush_page(&self, page_id: PageId) -> CorvusResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(false);
        };
        let is_dirty = {
            let meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id {
                return Ok(false);
            }
            meta.is_dirty
        };
        if !is_dirty {
            return Ok(true);
        }
        let bytes = {
            let _latch = self.pool.frame_lock(frame_id).read();
            Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) })
        };
        self.pool.write_page_to_disk(page_id, bytes)?;
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.page_id == page_id {
            meta.is_dirty = false;
        }
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> CorvusResult<()> {
        for page_id in self.pool.mapped_page_ids() {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and release its id. Refuses (returns false)
    /// while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> CorvusResult<bool> {
        let (lock, created_here) = self.inflight_lock(page_id);
        let held = lock.lock();
        let result = self.delete_page_inner(page_id);
        drop(held);
        if created_here {
            self.inflight_loads.remove(&page_id);
        }
        result
    }

    fn delete_page_inner(&self, page_id: PageId) -> CorvusResult<bool> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            let released = {
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id == page_id {
                    if meta.pin_count > 0 {
                        return Ok(false);
                    }
                    self.pool.remove_mapping(page_id);
                    *meta = FrameMeta::default();
                    let mut rep = self.replacer.lock();
                    rep.remove(frame_id);
                    true
                } else {
                    // Stale mapping; the frame belongs to another page now.
                    false
                }
            };
            if released {
                self.pool.reset_frame(frame_id);
                self.pool.push_free_frame(frame_id);
            }
        }
        self.pool
            .disk_scheduler()
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| CorvusError::Internal(format!("Channel disconnected: {}", e)))??;
        Ok(true)
    }

    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let frame_id = self.pool.lookup_frame(page_id)?;
        let meta = self.pool.frame_meta(frame_id);
        if meta.page_id == page_id {
            Some(meta.pin_count)
        } else {
            None
        }
    }

    /// Number of frames the replacer could evict right now.
    pub fn evictable_count(&self) -> usize {
        self.replacer.lock().size()
    }

    fn inflight_lock(&self, page_id: PageId) -> (Arc<Mutex<()>>, bool) {
        if let Some(existing) = self.inflight_loads.get(&page_id) {
            (existing.clone(), false)
        } else {
            let arc = Arc::new(Mutex::new(()));
            self.inflight_loads.insert(page_id, arc.clone());
            (arc, true)
        }
    }

    /// Pin the frame holding `page_id`, loading the page from disk if it is
    /// not resident.
    fn pin_frame(&self, page_id: PageId) -> CorvusResult<FrameId> {
        loop {
            if let Some(frame_id) = self.pool.lookup_frame(page_id) {
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id == page_id {
                    meta.pin_count += 1;
                    let mut rep = self.replacer.lock();
                    let _ = rep.record_access(frame_id, page_id);
                    let _ = rep.set_evictable(frame_id, false);
                    return Ok(frame_id);
                }
                // Stale mapping: the frame was reassigned under us. Retry
                // through the load path.
            }

            let (lock, created_here) = self.inflight_lock(page_id);
            let held = lock.lock();
            if self.pool.lookup_frame(page_id).is_some() {
                // Someone loaded it while we waited; take the resident path.
                drop(held);
                if created_here {
                    self.inflight_loads.remove(&page_id);
                }
                continue;
            }

            let load_result = self.load_and_pin(page_id);
            drop(held);
            if created_here {
                self.inflight_loads.remove(&page_id);
            }
            return load_result;
        }
    }

    fn load_and_pin(&self, page_id: PageId) -> CorvusResult<FrameId> {
        let frame_id = self.allocate_frame()?;
        if let Err(e) = self.pool.load_page_into_frame(page_id, frame_id) {
            self.pool.push_free_frame(frame_id);
            return Err(e);
        }
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
            self.pool.insert_mapping(page_id, frame_id);
            let mut rep = self.replacer.lock();
            let _ = rep.record_access(frame_id, page_id);
            let _ = rep.set_evictable(frame_id, false);
        }
        Ok(frame_id)
    }

    fn allocate_frame(&self) -> CorvusResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim_frame()
    }

    fn evict_victim_frame(&self) -> CorvusResult<FrameId> {
        loop {
            let victim = {
                let mut rep = self.replacer.lock();
                match rep.evict() {
                    Some(frame_id) => frame_id,
                    None => {
                        return Err(CorvusError::ResourceExhausted(
                            "Cannot allocate frame: buffer pool is full".to_string(),
                        ))
                    }
                }
            };

            let page_id = self.pool.frame_meta(victim).page_id;
            if page_id == INVALID_PAGE_ID {
                return Ok(victim);
            }

            let (lock, created_here) = self.inflight_lock(page_id);
            let held = lock.lock();

            // Re-verify under the frame meta: a pin may have raced in after
            // the policy picked this victim. Never evict a pinned frame.
            let write_back = {
                let mut meta = self.pool.frame_meta(victim);
                if meta.page_id != page_id {
                    None
                } else if meta.pin_count > 0 {
                    let mut rep = self.replacer.lock();
                    let _ = rep.record_access(victim, page_id);
                    let _ = rep.set_evictable(victim, false);
                    drop(rep);
                    drop(meta);
                    drop(held);
                    if created_here {
                        self.inflight_loads.remove(&page_id);
                    }
                    continue;
                } else {
                    self.pool.remove_mapping(page_id);
                    let bytes = if meta.is_dirty {
                        // Pin count is zero and the mapping is gone, so no
                        // guard exists or can appear; the latch is free.
                        let _latch = self.pool.frame_lock(victim).read();
                        Some(Bytes::copy_from_slice(unsafe {
                            self.pool.frame_slice(victim)
                        }))
                    } else {
                        None
                    };
                    *meta = FrameMeta::default();
                    Some(bytes)
                }
            };

            let result = match write_back {
                None => {
                    // Frame changed hands; pick another victim.
                    drop(held);
                    if created_here {
                        self.inflight_loads.remove(&page_id);
                    }
                    continue;
                }
                Some(None) => Ok(victim),
                Some(Some(bytes)) => match self.pool.write_page_to_disk(page_id, bytes) {
                    Ok(()) => Ok(victim),
                    Err(e) => {
                        self.pool.push_free_frame(victim);
                        Err(e)
                    }
                },
            };
            drop(held);
            if created_here {
                self.inflight_loads.remove(&page_id);
            }
            return result;
        }
    }
}
