mod buffer_manager;
mod buffer_pool;
mod page;

pub use buffer_manager::BufferPoolManager;
pub use buffer_pool::{BufferPool, FrameId, FrameMeta};
pub use page::{
    AtomicPageId, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID, PAGE_SIZE,
};
