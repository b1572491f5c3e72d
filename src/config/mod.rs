use crate::buffer::PageId;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    /// First page id handed out by the pool allocator. On a cold start this
    /// must be larger than any persisted page id.
    pub first_page_id: PageId,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
            first_page_id: 1,
        }
    }
}
