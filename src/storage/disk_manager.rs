use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use dashmap::DashMap;
use log::debug;

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{CorvusError, CorvusResult};

/// Physical page store the scheduler delegates to. All calls are synchronous;
/// the disk scheduler provides the single serialization point above this.
pub trait DiskManager: Debug + Send + Sync + 'static {
    fn read_page(&self, page_id: PageId) -> CorvusResult<[u8; PAGE_SIZE]>;

    fn write_page(&self, page_id: PageId, data: &[u8]) -> CorvusResult<()>;

    /// Release the id for reuse. A subsequent read observes a zeroed page.
    fn deallocate_page(&self, page_id: PageId) -> CorvusResult<()>;
}

fn check_page_id(op: &str, page_id: PageId) -> CorvusResult<()> {
    if page_id == INVALID_PAGE_ID {
        return Err(CorvusError::Storage(format!("{}: invalid page id", op)));
    }
    Ok(())
}

/// File-backed manager. Page `p` lives at byte offset `(p - 1) * PAGE_SIZE`.
/// A mutex wraps the file handle so only one thread touches it at a time.
#[derive(Debug)]
pub struct FileDiskManager {
    db_file: Mutex<File>,
}

impl FileDiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> CorvusResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        debug!("opened db file {:?}", db_path.as_ref());
        Ok(Self {
            db_file: Mutex::new(db_file),
        })
    }

    fn offset(page_id: PageId) -> u64 {
        (page_id - 1) as u64 * PAGE_SIZE as u64
    }

    fn lock_file(&self) -> CorvusResult<std::sync::MutexGuard<'_, File>> {
        self.db_file
            .lock()
            .map_err(|_| CorvusError::Internal("db file mutex poisoned".to_string()))
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId) -> CorvusResult<[u8; PAGE_SIZE]> {
        check_page_id("read_page", page_id)?;
        let mut file = self.lock_file()?;
        let mut buf = [0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(Self::offset(page_id)))?;
        // Short read past EOF leaves the tail zeroed, which is exactly the
        // contract for a never-written page.
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> CorvusResult<()> {
        check_page_id("write_page", page_id)?;
        if data.len() != PAGE_SIZE {
            return Err(CorvusError::Storage(format!(
                "write_page: expected {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        let mut file = self.lock_file()?;
        file.seek(SeekFrom::Start(Self::offset(page_id)))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    fn deallocate_page(&self, page_id: PageId) -> CorvusResult<()> {
        check_page_id("deallocate_page", page_id)?;
        let mut file = self.lock_file()?;
        let end = Self::offset(page_id) + PAGE_SIZE as u64;
        if file.metadata()?.len() < end {
            // Page was never materialized on disk; nothing to scrub.
            return Ok(());
        }
        file.seek(SeekFrom::Start(Self::offset(page_id)))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        file.flush()?;
        Ok(())
    }
}

/// Unlimited-memory manager for tests. Reads of pages never written return a
/// zeroed page.
#[derive(Debug, Default)]
pub struct MemoryDiskManager {
    pages: DashMap<PageId, Box<[u8; PAGE_SIZE]>>,
}

impl MemoryDiskManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiskManager for MemoryDiskManager {
    fn read_page(&self, page_id: PageId) -> CorvusResult<[u8; PAGE_SIZE]> {
        check_page_id("read_page", page_id)?;
        match self.pages.get(&page_id) {
            Some(page) => Ok(**page),
            None => Ok([0u8; PAGE_SIZE]),
        }
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> CorvusResult<()> {
        check_page_id("write_page", page_id)?;
        if data.len() != PAGE_SIZE {
            return Err(CorvusError::Storage(format!(
                "write_page: expected {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        let mut page = Box::new([0u8; PAGE_SIZE]);
        page.copy_from_slice(data);
        self.pages.insert(page_id, page);
        Ok(())
    }

    fn deallocate_page(&self, page_id: PageId) -> CorvusResult<()> {
        check_page_id("deallocate_page", page_id)?;
        self.pages.remove(&page_id);
        Ok(())
    }
}
