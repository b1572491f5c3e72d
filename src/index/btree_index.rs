use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferPoolManager, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::error::{CorvusError, CorvusResult};
use crate::index::btree_iterator::TreeIndexIterator;
use crate::index::comparator::KeyComparator;
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, Storable,
};
use crate::storage::page::{
    internal_slot_capacity, leaf_slot_capacity, BPlusTreeHeaderPage, BPlusTreeInternalPage,
    BPlusTreeLeafPage, BPlusTreePage,
};

/// Disk-backed B+tree over the buffer pool. Keys and values are fixed-width
/// `Storable` types; `TOMBS` is the per-leaf tombstone buffer capacity, with
/// 0 meaning deletes are applied physically on the spot.
///
/// Readers descend with shared latches, releasing each node before its
/// child is latched, so they never block while holding a latch. Mutations
/// are serialized by `mutation_lock` (structural maintenance climbs the
/// tree through the parent pointers kept in every node, and that recursion
/// needs the whole restructure to be atomic with respect to other writers);
/// their descent still keeps the parent's shared latch held until the
/// leaf's exclusive latch is acquired, and chases a concurrently split leaf
/// through the chain before mutating anything.
#[derive(Debug)]
pub struct BPlusTree<K, V, const TOMBS: usize = 0>
where
    K: Storable + Default,
    V: Storable,
{
    pub index_name: String,
    pub header_page_id: PageId,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub comparator: KeyComparator<K>,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    mutation_lock: Mutex<()>,
    _marker: std::marker::PhantomData<V>,
}

impl<K, V, const TOMBS: usize> BPlusTree<K, V, TOMBS>
where
    K: Storable + Default,
    V: Storable,
{
    /// `header_page_id` must name a page the caller obtained from the pool;
    /// it is rewritten to an empty-tree header. `internal_max_size` counts
    /// children per internal node, `leaf_max_size` physical leaf slots.
    pub fn new(
        index_name: impl Into<String>,
        header_page_id: PageId,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator<K>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> CorvusResult<Self> {
        // A node briefly holds one entry past max_size before its split, so
        // the physical capacity must leave that headroom.
        let leaf_cap = leaf_slot_capacity::<K, V>(TOMBS) as u32 - 1;
        let internal_cap = internal_slot_capacity::<K>() as u32 - 1;
        let tree = Self {
            index_name: index_name.into(),
            header_page_id,
            buffer_pool,
            comparator,
            leaf_max_size: leaf_max_size.min(leaf_cap),
            internal_max_size: internal_max_size.min(internal_cap),
            mutation_lock: Mutex::new(()),
            _marker: std::marker::PhantomData,
        };
        let mut header_guard = tree.buffer_pool.fetch_page_write(header_page_id)?;
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id: INVALID_PAGE_ID,
        }));
        Ok(tree)
    }

    /// Reattach to a tree whose header page already exists on disk. The
    /// header is left untouched; the pool's page-id allocator must have been
    /// seeded past every persisted page id.
    pub fn open(
        index_name: impl Into<String>,
        header_page_id: PageId,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator<K>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Self {
        let leaf_cap = leaf_slot_capacity::<K, V>(TOMBS) as u32 - 1;
        let internal_cap = internal_slot_capacity::<K>() as u32 - 1;
        Self {
            index_name: index_name.into(),
            header_page_id,
            buffer_pool,
            comparator,
            leaf_max_size: leaf_max_size.min(leaf_cap),
            internal_max_size: internal_max_size.min(internal_cap),
            mutation_lock: Mutex::new(()),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn root_page_id(&self) -> CorvusResult<PageId> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        Ok(header.root_page_id)
    }

    fn set_root_page_id(&self, page_id: PageId) -> CorvusResult<()> {
        let mut header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id: page_id,
        }));
        Ok(())
    }

    pub fn is_empty(&self) -> CorvusResult<bool> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    /// Read-crab from the root to the leaf that may contain `key`: the guard
    /// on each node is released before its child is latched.
    pub(crate) fn find_leaf_page(&self, key: &K) -> CorvusResult<PageId> {
        let mut current = self.root_page_id()?;
        if current == INVALID_PAGE_ID {
            return Err(CorvusError::Internal(
                "find_leaf_page called on an empty tree".to_string(),
            ));
        }
        loop {
            let guard = self.buffer_pool.fetch_page_read(current)?;
            let (page, _) = BPlusTreePageCodec::decode::<K, V, TOMBS>(guard.data())?;
            match page {
                BPlusTreePage::Internal(node) => {
                    let child = node.look_up(self.comparator, key);
                    drop(guard);
                    current = child;
                }
                BPlusTreePage::Leaf(_) => return Ok(current),
            }
        }
    }

    /// Exclusive-latch the leaf that owns `key`, for insert/delete. The
    /// parent's shared latch stays held until the leaf's exclusive latch is
    /// acquired, so routing cannot change under the latch trade; a split
    /// that raced the trade itself (the splitter publishes the new sibling
    /// before it touches the parent) is chased through the leaf chain, and
    /// an over-long chase restarts from the root.
    fn find_leaf_page_pessimistic(
        &self,
        key: &K,
    ) -> CorvusResult<(WritePageGuard, BPlusTreeLeafPage<K, V, TOMBS>)> {
        const MAX_CHAIN_HOPS: usize = 8;
        loop {
            let root_page_id = self.root_page_id()?;
            if root_page_id == INVALID_PAGE_ID {
                return Err(CorvusError::Internal(
                    "find_leaf_page_pessimistic called on an empty tree".to_string(),
                ));
            }
            let mut parent_guard: Option<ReadPageGuard> = None;
            let mut current = root_page_id;
            let mut leaf_guard = loop {
                let guard = self.buffer_pool.fetch_page_read(current)?;
                let (page, _) = BPlusTreePageCodec::decode::<K, V, TOMBS>(guard.data())?;
                match page {
                    BPlusTreePage::Internal(node) => {
                        let child = node.look_up(self.comparator, key);
                        // retain this node's latch until the child's is
                        // taken; the grandparent's latch drops here
                        parent_guard = Some(guard);
                        current = child;
                    }
                    BPlusTreePage::Leaf(_) => {
                        drop(guard);
                        let write_guard = self.buffer_pool.fetch_page_write(current)?;
                        drop(parent_guard.take());
                        break write_guard;
                    }
                }
            };
            let (mut leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(leaf_guard.data())?;

            let mut hops = 0;
            let mut gave_up = false;
            loop {
                let Some(last_key) = leaf.array.last().map(|(k, _)| k.clone()) else {
                    break;
                };
                if (self.comparator)(key, &last_key) != Ordering::Greater {
                    break;
                }
                let next_page_id = leaf.header.next_page_id;
                if next_page_id == INVALID_PAGE_ID {
                    break;
                }
                // peek at the successor's minimum under a shared latch
                let next_first = {
                    let peek = self.buffer_pool.fetch_page_read(next_page_id)?;
                    let (next_leaf, _) =
                        BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(peek.data())?;
                    next_leaf.first_key().cloned()
                };
                let Some(next_first) = next_first else {
                    break;
                };
                if (self.comparator)(key, &next_first) == Ordering::Less {
                    break;
                }
                hops += 1;
                if hops > MAX_CHAIN_HOPS {
                    gave_up = true;
                    break;
                }
                drop(leaf_guard);
                leaf_guard = self.buffer_pool.fetch_page_write(next_page_id)?;
                let (next_leaf, _) =
                    BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(leaf_guard.data())?;
                leaf = next_leaf;
            }
            if gave_up {
                drop(leaf_guard);
                continue;
            }
            return Ok((leaf_guard, leaf));
        }
    }

    pub(crate) fn find_first_leaf_page(&self) -> CorvusResult<PageId> {
        let mut current = self.root_page_id()?;
        if current == INVALID_PAGE_ID {
            return Err(CorvusError::Internal(
                "find_first_leaf_page called on an empty tree".to_string(),
            ));
        }
        loop {
            let guard = self.buffer_pool.fetch_page_read(current)?;
            let (page, _) = BPlusTreePageCodec::decode::<K, V, TOMBS>(guard.data())?;
            match page {
                BPlusTreePage::Internal(node) => {
                    let child = node.value_at(0);
                    drop(guard);
                    current = child;
                }
                BPlusTreePage::Leaf(_) => return Ok(current),
            }
        }
    }

    /// Point lookup: append the live value for `key` (if any) to `result`.
    /// Returns true iff something was appended. When a racing split has
    /// carried the key past the routed leaf, the chain is walked right.
    pub fn get_value(&self, key: &K, result: &mut Vec<V>) -> CorvusResult<bool> {
        if self.is_empty()? {
            return Ok(false);
        }
        let found_before = result.len();
        let mut leaf_page_id = self.find_leaf_page(key)?;
        loop {
            let guard = self.buffer_pool.fetch_page_read(leaf_page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
            leaf.find_and_collect(self.comparator, key, result);
            if result.len() > found_before {
                return Ok(true);
            }
            let walk_right = match leaf.array.last() {
                Some((last_key, _)) => {
                    (self.comparator)(key, last_key) == Ordering::Greater
                        && leaf.header.next_page_id != INVALID_PAGE_ID
                }
                None => false,
            };
            if !walk_right {
                return Ok(false);
            }
            leaf_page_id = leaf.header.next_page_id;
        }
    }

    /// Insert a key/value pair. Returns false when the key is already live
    /// in the tree; a tombstoned slot is revived instead.
    pub fn insert(&self, key: &K, value: V) -> CorvusResult<bool> {
        let _mutation = self.mutation_lock.lock();

        if self.is_empty()? {
            // Re-check under the header's exclusive latch so two inserts
            // cannot both start a tree.
            let mut header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
            let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
            if header.root_page_id == INVALID_PAGE_ID {
                let root_page_id = self.buffer_pool.new_page()?;
                {
                    let mut root_guard = self.buffer_pool.fetch_page_write(root_page_id)?;
                    let mut leaf = BPlusTreeLeafPage::<K, V, TOMBS>::new(self.leaf_max_size);
                    leaf.page_id = root_page_id;
                    root_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                }
                header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
                    root_page_id,
                }));
            }
        }

        let (mut leaf_guard, mut leaf) = self.find_leaf_page_pessimistic(key)?;
        let leaf_page_id = leaf_guard.page_id();

        let pre_min = leaf.first_key().cloned();
        if !leaf.insert(self.comparator, key.clone(), value) {
            return Ok(false);
        }
        let inserted_at_begin = leaf.is_begin;
        let parent_page_id = leaf.parent_page_id;
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        // A new minimum makes every ancestor separator on the leftmost-path
        // stale; repair before any split reshuffles the parents.
        if inserted_at_begin && parent_page_id != INVALID_PAGE_ID && pre_min.is_some() {
            self.update_first_key_upwards(key, leaf_page_id, parent_page_id)?;
        }

        self.push_up(leaf_guard)?;
        Ok(true)
    }

    /// Replace the separator that tracks the minimum of `child_page_id`'s
    /// subtree with `new_key`. When the child is the leftmost subtree of its
    /// parent the separator lives further up, so the walk continues.
    fn update_first_key_upwards(
        &self,
        new_key: &K,
        mut child_page_id: PageId,
        mut parent_page_id: PageId,
    ) -> CorvusResult<()> {
        while parent_page_id != INVALID_PAGE_ID {
            let mut parent_guard = self.buffer_pool.fetch_page_write(parent_page_id)?;
            let (mut parent, _) = BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
            let Some(index) = parent.value_index(child_page_id) else {
                return Err(CorvusError::Internal(
                    "child missing from parent during separator repair".to_string(),
                ));
            };
            if index > 0 {
                parent.set_key_at(index, new_key.clone());
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
            child_page_id = parent_page_id;
            parent_page_id = parent.parent_page_id;
        }
        Ok(())
    }

    /// Post-insert structural fix: split every node on the path that grew
    /// past its bound, bubbling the separator into the parent. Page
    /// allocation failure aborts the fix and leaves the (oversized but
    /// consistent) node in place.
    fn push_up(&self, mut guard: WritePageGuard) -> CorvusResult<()> {
        loop {
            let page_id = guard.page_id();
            let (page, _) = BPlusTreePageCodec::decode::<K, V, TOMBS>(guard.data())?;
            match page {
                BPlusTreePage::Leaf(mut leaf) => {
                    if leaf.header.current_size < self.leaf_max_size {
                        return Ok(());
                    }
                    let parent_page_id = leaf.parent_page_id;
                    let Some((new_page_id, new_root)) =
                        self.allocate_split_pages(parent_page_id)?
                    else {
                        return Ok(());
                    };

                    let mut new_guard = self.buffer_pool.fetch_page_write(new_page_id)?;
                    let mut new_leaf = BPlusTreeLeafPage::<K, V, TOMBS>::new(self.leaf_max_size);
                    new_leaf.page_id = new_page_id;
                    leaf.split(&mut new_leaf);
                    let split_key = new_leaf
                        .first_key()
                        .cloned()
                        .ok_or_else(|| CorvusError::Internal("split produced an empty leaf".to_string()))?;
                    let old_next = new_leaf.header.next_page_id;

                    if let Some(root_page_id) = new_root {
                        leaf.parent_page_id = root_page_id;
                        new_leaf.parent_page_id = root_page_id;
                        guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                        new_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&new_leaf));
                        {
                            let mut root_guard =
                                self.buffer_pool.fetch_page_write(root_page_id)?;
                            let mut root =
                                BPlusTreeInternalPage::<K>::new(self.internal_max_size);
                            root.page_id = root_page_id;
                            root.first_insert(split_key, page_id, new_page_id);
                            root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&root));
                        }
                        drop(new_guard);
                        drop(guard);
                        self.fix_prev_pointer(old_next, new_page_id)?;
                        self.set_root_page_id(root_page_id)?;
                        return Ok(());
                    }

                    guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                    new_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&new_leaf));
                    drop(new_guard);
                    drop(guard);
                    self.fix_prev_pointer(old_next, new_page_id)?;

                    let mut parent_guard = self.buffer_pool.fetch_page_write(parent_page_id)?;
                    let (mut parent, _) =
                        BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
                    parent.insert(self.comparator, split_key, new_page_id);
                    parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                    guard = parent_guard;
                }
                BPlusTreePage::Internal(mut node) => {
                    if node.header.current_size <= self.internal_max_size {
                        return Ok(());
                    }
                    let parent_page_id = node.parent_page_id;
                    let Some((new_page_id, new_root)) =
                        self.allocate_split_pages(parent_page_id)?
                    else {
                        return Ok(());
                    };

                    let mut new_guard = self.buffer_pool.fetch_page_write(new_page_id)?;
                    let mut new_node = BPlusTreeInternalPage::<K>::new(self.internal_max_size);
                    new_node.page_id = new_page_id;
                    let (split_key, moved_children) = node.split(&mut new_node);

                    if let Some(root_page_id) = new_root {
                        node.parent_page_id = root_page_id;
                        new_node.parent_page_id = root_page_id;
                        guard.overwrite(&BPlusTreeInternalPageCodec::encode(&node));
                        new_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_node));
                        {
                            let mut root_guard =
                                self.buffer_pool.fetch_page_write(root_page_id)?;
                            let mut root =
                                BPlusTreeInternalPage::<K>::new(self.internal_max_size);
                            root.page_id = root_page_id;
                            root.first_insert(split_key, page_id, new_page_id);
                            root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&root));
                        }
                        drop(new_guard);
                        drop(guard);
                        // Latches are gone; re-point the moved subtrees.
                        for child in moved_children {
                            self.set_parent(child, new_page_id)?;
                        }
                        self.set_root_page_id(root_page_id)?;
                        return Ok(());
                    }

                    new_node.parent_page_id = parent_page_id;
                    guard.overwrite(&BPlusTreeInternalPageCodec::encode(&node));
                    new_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_node));
                    drop(new_guard);
                    drop(guard);
                    for child in moved_children {
                        self.set_parent(child, new_page_id)?;
                    }

                    let mut parent_guard = self.buffer_pool.fetch_page_write(parent_page_id)?;
                    let (mut parent, _) =
                        BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
                    parent.insert(self.comparator, split_key, new_page_id);
                    parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                    guard = parent_guard;
                }
            }
        }
    }

    /// Reserve the pages a split needs before touching any node: the new
    /// right sibling, plus a new root when the split node has no parent.
    /// `None` means the pool is exhausted and the fix should be abandoned.
    fn allocate_split_pages(
        &self,
        parent_page_id: PageId,
    ) -> CorvusResult<Option<(PageId, Option<PageId>)>> {
        let new_page_id = match self.buffer_pool.new_page() {
            Ok(page_id) => page_id,
            Err(e) if e.is_resource_exhausted() => return Ok(None),
            Err(e) => return Err(e),
        };
        if parent_page_id != INVALID_PAGE_ID {
            return Ok(Some((new_page_id, None)));
        }
        match self.buffer_pool.new_page() {
            Ok(root_page_id) => Ok(Some((new_page_id, Some(root_page_id)))),
            Err(e) if e.is_resource_exhausted() => {
                self.buffer_pool.delete_page(new_page_id)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn set_parent(&self, child_page_id: PageId, parent_page_id: PageId) -> CorvusResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(child_page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode::<K, V, TOMBS>(guard.data())?;
        page.set_parent_page_id(parent_page_id);
        guard.overwrite(&BPlusTreePageCodec::encode(&page));
        Ok(())
    }

    fn fix_prev_pointer(&self, leaf_page_id: PageId, prev_page_id: PageId) -> CorvusResult<()> {
        if leaf_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut guard = self.buffer_pool.fetch_page_write(leaf_page_id)?;
        let (mut leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
        leaf.header.prev_page_id = prev_page_id;
        guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        Ok(())
    }

    /// Delete `key`. Absent keys are a no-op. Depending on `TOMBS` this is a
    /// physical removal or a buffered tombstone, followed by separator
    /// repair and whatever structural maintenance the leaf now needs.
    pub fn remove(&self, key: &K) -> CorvusResult<()> {
        let _mutation = self.mutation_lock.lock();

        if self.is_empty()? {
            return Ok(());
        }
        let (mut leaf_guard, mut leaf) = self.find_leaf_page_pessimistic(key)?;
        let leaf_page_id = leaf_guard.page_id();

        if !leaf.delete(self.comparator, key) {
            return Ok(());
        }
        let parent_page_id = leaf.parent_page_id;
        let first_slot_went_away = if TOMBS == 0 {
            leaf.is_update
        } else {
            leaf.need_deep_update
        };
        let new_first = leaf.first_key().cloned();
        leaf.is_update = false;
        leaf.need_deep_update = false;
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        if first_slot_went_away && parent_page_id != INVALID_PAGE_ID {
            if let Some(new_first) = &new_first {
                self.update_first_key_upwards(new_first, leaf_page_id, parent_page_id)?;
            }
            // An emptied leaf needs its separator removed, not repaired;
            // the merge below takes care of both.
        }
        drop(leaf_guard);

        if TOMBS > 0 {
            self.balance_live(leaf_page_id)?;
        }
        self.check_for_leaf(leaf_page_id)?;
        Ok(())
    }

    /// Tombstoning can leave a leaf short on live entries while its physical
    /// size still honors the bound. Borrow live entries from a sibling under
    /// the same parent (left first); when no sibling can spare any, the leaf
    /// simply stays thin until compaction triggers fire.
    fn balance_live(&self, leaf_page_id: PageId) -> CorvusResult<()> {
        let (parent_page_id, live, min_size) = {
            let guard = self.buffer_pool.fetch_page_read(leaf_page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
            (
                leaf.parent_page_id,
                leaf.live_size(),
                leaf.min_size() as usize,
            )
        };
        if live >= min_size || parent_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut parent_guard = self.buffer_pool.fetch_page_write(parent_page_id)?;
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
        let Some(index) = parent.value_index(leaf_page_id) else {
            return Ok(());
        };
        let (left_page_id, right_page_id) = parent.sibling_page_ids(leaf_page_id);

        if let Some(left_page_id) = left_page_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_page_id)?;
            let mut node_guard = self.buffer_pool.fetch_page_write(leaf_page_id)?;
            let (mut left, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(left_guard.data())?;
            let (mut node, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(node_guard.data())?;
            let deficit = (node.min_size() as usize).saturating_sub(node.live_size());
            if deficit > 0 && left.live_size() > left.min_size() as usize + deficit - 1 {
                for _ in 0..deficit {
                    if let Some(entry) = left.pop_back() {
                        node.push_front(entry);
                    }
                }
                let new_first = node.first_key().cloned().ok_or_else(|| {
                    CorvusError::Internal("redistribution produced an empty leaf".to_string())
                })?;
                parent.set_key_at(index, new_first);
                left_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&left));
                node_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&node));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
        }

        if let Some(right_page_id) = right_page_id {
            let mut node_guard = self.buffer_pool.fetch_page_write(leaf_page_id)?;
            let mut right_guard = self.buffer_pool.fetch_page_write(right_page_id)?;
            let (mut node, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(node_guard.data())?;
            let (mut right, _) =
                BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(right_guard.data())?;
            let deficit = (node.min_size() as usize).saturating_sub(node.live_size());
            if deficit > 0 && right.live_size() > right.min_size() as usize + deficit - 1 {
                for _ in 0..deficit {
                    if let Some(entry) = right.pop_front() {
                        node.push_back(entry);
                    }
                }
                let right_first = right.first_key().cloned().ok_or_else(|| {
                    CorvusError::Internal("redistribution emptied the donor leaf".to_string())
                })?;
                parent.set_key_at(index + 1, right_first);
                node_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&node));
                right_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&right));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
        }

        Ok(())
    }

    /// Physical-size maintenance for a leaf: redistribution from a sibling
    /// sharing the parent (left first), else a merge. Runs after every
    /// delete and recurses into the internal layer when a merge removes a
    /// separator.
    fn check_for_leaf(&self, leaf_page_id: PageId) -> CorvusResult<()> {
        let (parent_page_id, size, min_size) = {
            let guard = self.buffer_pool.fetch_page_read(leaf_page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
            (
                leaf.parent_page_id,
                leaf.array.len(),
                leaf.min_size() as usize,
            )
        };
        if parent_page_id == INVALID_PAGE_ID {
            return self.collapse_root_leaf(leaf_page_id);
        }
        if size >= min_size {
            return Ok(());
        }

        let mut parent_guard = self.buffer_pool.fetch_page_write(parent_page_id)?;
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
        let Some(index) = parent.value_index(leaf_page_id) else {
            return Ok(());
        };
        let (left_page_id, right_page_id) = parent.sibling_page_ids(leaf_page_id);

        // Redistribution first: live entries move, so the donor bound is
        // checked on live counts (for TOMBS = 0 they equal physical counts).
        if let Some(left_page_id) = left_page_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_page_id)?;
            let mut node_guard = self.buffer_pool.fetch_page_write(leaf_page_id)?;
            let (mut left, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(left_guard.data())?;
            let (mut node, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(node_guard.data())?;
            let deficit = (node.min_size() as usize).saturating_sub(node.array.len());
            if deficit > 0 && left.live_size() > left.min_size() as usize + deficit - 1 {
                for _ in 0..deficit {
                    if let Some(entry) = left.pop_back() {
                        node.push_front(entry);
                    }
                }
                let new_first = node.first_key().cloned().ok_or_else(|| {
                    CorvusError::Internal("redistribution produced an empty leaf".to_string())
                })?;
                parent.set_key_at(index, new_first);
                left_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&left));
                node_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&node));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
        }
        if let Some(right_page_id) = right_page_id {
            let mut node_guard = self.buffer_pool.fetch_page_write(leaf_page_id)?;
            let mut right_guard = self.buffer_pool.fetch_page_write(right_page_id)?;
            let (mut node, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(node_guard.data())?;
            let (mut right, _) =
                BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(right_guard.data())?;
            let deficit = (node.min_size() as usize).saturating_sub(node.array.len());
            if deficit > 0 && right.live_size() > right.min_size() as usize + deficit - 1 {
                for _ in 0..deficit {
                    if let Some(entry) = right.pop_front() {
                        node.push_back(entry);
                    }
                }
                let right_first = right.first_key().cloned().ok_or_else(|| {
                    CorvusError::Internal("redistribution emptied the donor leaf".to_string())
                })?;
                parent.set_key_at(index + 1, right_first);
                node_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&node));
                right_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&right));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
        }

        // Merge: the left sibling absorbs this leaf, or this leaf absorbs
        // its right sibling.
        let (absorber_page_id, victim_page_id, victim_index) = match (left_page_id, right_page_id)
        {
            (Some(left_page_id), _) => (left_page_id, leaf_page_id, index),
            (None, Some(right_page_id)) => (leaf_page_id, right_page_id, index + 1),
            (None, None) => return Ok(()),
        };
        self.merge_leaves(parent_guard, parent, absorber_page_id, victim_page_id, victim_index)
    }

    /// `victim_index` is the parent slot of `victim_page_id`. The absorber
    /// keeps living; the victim's page is deleted afterwards.
    fn merge_leaves(
        &self,
        mut parent_guard: WritePageGuard,
        mut parent: BPlusTreeInternalPage<K>,
        absorber_page_id: PageId,
        victim_page_id: PageId,
        victim_index: usize,
    ) -> CorvusResult<()> {
        let mut left_guard = self.buffer_pool.fetch_page_write(absorber_page_id)?;
        let mut right_guard = self.buffer_pool.fetch_page_write(victim_page_id)?;
        let (mut left, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(left_guard.data())?;
        let (mut right, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(right_guard.data())?;

        // Tombstones above capacity cannot ride along; compact both sides
        // first and repair the absorber's separator if its minimum moved.
        if TOMBS > 0 && left.tombstones.len() + right.tombstones.len() > TOMBS {
            let old_first = left.first_key().cloned();
            left.cleanup_tombstones();
            right.cleanup_tombstones();
            if let (Some(old), Some(new)) = (old_first, left.first_key()) {
                if let Some(left_index) = parent.value_index(absorber_page_id) {
                    if left_index > 0 && (self.comparator)(&old, new) != Ordering::Equal {
                        parent.set_key_at(left_index, new.clone());
                    }
                }
            }
        }
        if left.array.len() + right.array.len() > self.leaf_max_size as usize {
            // Does not fit; persist any compaction and leave the node thin.
            left_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&left));
            right_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&right));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            return Ok(());
        }

        left.absorb(&mut right);
        let _ = parent.delete_at(victim_index);
        let successor = left.header.next_page_id;

        left_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&left));
        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        drop(right_guard);
        drop(left_guard);

        self.fix_prev_pointer(successor, absorber_page_id)?;
        self.buffer_pool.delete_page(victim_page_id)?;

        let parent_page_id = parent_guard.page_id();
        let parent_is_root = parent.parent_page_id == INVALID_PAGE_ID;
        let parent_size = parent.header.current_size;
        let parent_min = parent.min_size();
        drop(parent_guard);

        if parent_is_root {
            if parent_size == 1 {
                self.collapse_root_internal(parent_page_id)?;
            }
        } else if parent_size < parent_min {
            self.check_for_internal(parent_page_id)?;
        }
        Ok(())
    }

    /// Physical-size maintenance for an internal node, mirroring the leaf
    /// path with (separator, child) rotations and parent-pointer fixups.
    fn check_for_internal(&self, node_page_id: PageId) -> CorvusResult<()> {
        let (parent_page_id, size, min_size) = {
            let guard = self.buffer_pool.fetch_page_read(node_page_id)?;
            let (node, _) = BPlusTreeInternalPageCodec::decode::<K>(guard.data())?;
            (
                node.parent_page_id,
                node.header.current_size,
                node.min_size(),
            )
        };
        if parent_page_id == INVALID_PAGE_ID {
            if size == 1 {
                return self.collapse_root_internal(node_page_id);
            }
            return Ok(());
        }
        if size >= min_size {
            return Ok(());
        }

        let mut parent_guard = self.buffer_pool.fetch_page_write(parent_page_id)?;
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
        let Some(index) = parent.value_index(node_page_id) else {
            return Ok(());
        };
        let (left_page_id, right_page_id) = parent.sibling_page_ids(node_page_id);

        if let Some(left_page_id) = left_page_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_page_id)?;
            let mut node_guard = self.buffer_pool.fetch_page_write(node_page_id)?;
            let (mut left, _) = BPlusTreeInternalPageCodec::decode::<K>(left_guard.data())?;
            let (mut node, _) = BPlusTreeInternalPageCodec::decode::<K>(node_guard.data())?;
            let deficit = node.min_size().saturating_sub(node.header.current_size) as usize;
            if deficit > 0
                && left.header.current_size > left.min_size() + deficit as u32 - 1
            {
                let mut adopted = Vec::with_capacity(deficit);
                for _ in 0..deficit {
                    let separator = parent.key_at(index).clone();
                    let (moved_key, moved_child) = left.pop_back();
                    node.push_front(separator, moved_child);
                    parent.set_key_at(index, moved_key);
                    adopted.push(moved_child);
                }
                left_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&left));
                node_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&node));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                drop(node_guard);
                drop(left_guard);
                drop(parent_guard);
                for child in adopted {
                    self.set_parent(child, node_page_id)?;
                }
                return Ok(());
            }
        }
        if let Some(right_page_id) = right_page_id {
            let mut node_guard = self.buffer_pool.fetch_page_write(node_page_id)?;
            let mut right_guard = self.buffer_pool.fetch_page_write(right_page_id)?;
            let (mut node, _) = BPlusTreeInternalPageCodec::decode::<K>(node_guard.data())?;
            let (mut right, _) = BPlusTreeInternalPageCodec::decode::<K>(right_guard.data())?;
            let deficit = node.min_size().saturating_sub(node.header.current_size) as usize;
            if deficit > 0
                && right.header.current_size > right.min_size() + deficit as u32 - 1
            {
                let mut adopted = Vec::with_capacity(deficit);
                for _ in 0..deficit {
                    let separator = parent.key_at(index + 1).clone();
                    let (promoted_key, moved_child) = right.pop_front();
                    node.push_back(separator, moved_child);
                    parent.set_key_at(index + 1, promoted_key);
                    adopted.push(moved_child);
                }
                node_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&node));
                right_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&right));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                drop(right_guard);
                drop(node_guard);
                drop(parent_guard);
                for child in adopted {
                    self.set_parent(child, node_page_id)?;
                }
                return Ok(());
            }
        }

        let (absorber_page_id, victim_page_id, victim_index) = match (left_page_id, right_page_id)
        {
            (Some(left_page_id), _) => (left_page_id, node_page_id, index),
            (None, Some(right_page_id)) => (node_page_id, right_page_id, index + 1),
            (None, None) => return Ok(()),
        };
        self.merge_internals(parent_guard, parent, absorber_page_id, victim_page_id, victim_index)
    }

    fn merge_internals(
        &self,
        mut parent_guard: WritePageGuard,
        mut parent: BPlusTreeInternalPage<K>,
        absorber_page_id: PageId,
        victim_page_id: PageId,
        victim_index: usize,
    ) -> CorvusResult<()> {
        let mut left_guard = self.buffer_pool.fetch_page_write(absorber_page_id)?;
        let mut right_guard = self.buffer_pool.fetch_page_write(victim_page_id)?;
        let (mut left, _) = BPlusTreeInternalPageCodec::decode::<K>(left_guard.data())?;
        let (mut right, _) = BPlusTreeInternalPageCodec::decode::<K>(right_guard.data())?;

        if left.header.current_size + right.header.current_size > self.internal_max_size {
            return Ok(());
        }

        let adopted: Vec<PageId> = right.array.iter().map(|(_, child)| *child).collect();
        let middle_key = parent.delete_at(victim_index);
        left.absorb(middle_key, &mut right);

        left_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&left));
        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        drop(right_guard);
        drop(left_guard);

        for child in adopted {
            self.set_parent(child, absorber_page_id)?;
        }
        self.buffer_pool.delete_page(victim_page_id)?;

        let parent_page_id = parent_guard.page_id();
        let parent_is_root = parent.parent_page_id == INVALID_PAGE_ID;
        let parent_size = parent.header.current_size;
        let parent_min = parent.min_size();
        drop(parent_guard);

        if parent_is_root {
            if parent_size == 1 {
                self.collapse_root_internal(parent_page_id)?;
            }
        } else if parent_size < parent_min {
            self.check_for_internal(parent_page_id)?;
        }
        Ok(())
    }

    /// A root internal node with a single child hands the root role down.
    fn collapse_root_internal(&self, root_page_id: PageId) -> CorvusResult<()> {
        let only_child = {
            let guard = self.buffer_pool.fetch_page_read(root_page_id)?;
            let (root, _) = BPlusTreeInternalPageCodec::decode::<K>(guard.data())?;
            if root.header.current_size != 1 {
                return Ok(());
            }
            root.value_at(0)
        };
        self.set_parent(only_child, INVALID_PAGE_ID)?;
        self.set_root_page_id(only_child)?;
        self.buffer_pool.delete_page(root_page_id)?;
        Ok(())
    }

    /// A root leaf disappears only once it is physically empty.
    fn collapse_root_leaf(&self, root_page_id: PageId) -> CorvusResult<()> {
        let empty = {
            let guard = self.buffer_pool.fetch_page_read(root_page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
            leaf.array.is_empty()
        };
        if !empty {
            return Ok(());
        }
        self.set_root_page_id(INVALID_PAGE_ID)?;
        self.buffer_pool.delete_page(root_page_id)?;
        Ok(())
    }

    pub fn begin(&self) -> CorvusResult<TreeIndexIterator<'_, K, V, TOMBS>> {
        TreeIndexIterator::new_at_first(self)
    }

    pub fn begin_at(&self, key: &K) -> CorvusResult<TreeIndexIterator<'_, K, V, TOMBS>> {
        TreeIndexIterator::new_at_key(self, key)
    }

    pub fn end(&self) -> TreeIndexIterator<'_, K, V, TOMBS> {
        TreeIndexIterator::end(self)
    }

    /// Debugging aid: every leaf in chain order.
    pub fn leaf_pages(&self) -> CorvusResult<Vec<BPlusTreeLeafPage<K, V, TOMBS>>> {
        let mut leaves = vec![];
        if self.is_empty()? {
            return Ok(leaves);
        }
        let mut page_id = self.find_first_leaf_page()?;
        while page_id != INVALID_PAGE_ID {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
            page_id = leaf.header.next_page_id;
            leaves.push(leaf);
        }
        Ok(leaves)
    }
}
