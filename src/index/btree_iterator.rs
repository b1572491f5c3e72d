use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::CorvusResult;
use crate::index::btree_index::BPlusTree;
use crate::storage::codec::{BPlusTreeLeafPageCodec, Storable};
use crate::storage::page::BPlusTreeLeafPage;

/// Forward iterator over the leaf chain in ascending key order. Tombstoned
/// slots are skipped transparently. The iterator is the `end()` sentinel
/// once no leaf remains under it.
#[derive(Debug)]
pub struct TreeIndexIterator<'a, K, V, const TOMBS: usize>
where
    K: Storable + Default,
    V: Storable,
{
    index: &'a BPlusTree<K, V, TOMBS>,
    // guard pins the page the decoded leaf was read from
    current_guard: Option<ReadPageGuard>,
    leaf: Option<BPlusTreeLeafPage<K, V, TOMBS>>,
    cursor: usize,
}

impl<'a, K, V, const TOMBS: usize> TreeIndexIterator<'a, K, V, TOMBS>
where
    K: Storable + Default,
    V: Storable,
{
    pub(crate) fn new_at_first(index: &'a BPlusTree<K, V, TOMBS>) -> CorvusResult<Self> {
        if index.is_empty()? {
            return Ok(Self::end(index));
        }
        let page_id = index.find_first_leaf_page()?;
        let guard = index.buffer_pool.fetch_page_read(page_id)?;
        let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
        let mut iterator = Self {
            index,
            current_guard: Some(guard),
            leaf: Some(leaf),
            cursor: 0,
        };
        iterator.skip_to_live_entry()?;
        Ok(iterator)
    }

    pub(crate) fn new_at_key(index: &'a BPlusTree<K, V, TOMBS>, key: &K) -> CorvusResult<Self> {
        if index.is_empty()? {
            return Ok(Self::end(index));
        }
        let page_id = index.find_leaf_page(key)?;
        let guard = index.buffer_pool.fetch_page_read(page_id)?;
        let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
        let cursor = match leaf.search(index.comparator, key) {
            Ok(slot) => slot,
            Err(position) => position,
        };
        let mut iterator = Self {
            index,
            current_guard: Some(guard),
            leaf: Some(leaf),
            cursor,
        };
        iterator.skip_to_live_entry()?;
        Ok(iterator)
    }

    pub(crate) fn end(index: &'a BPlusTree<K, V, TOMBS>) -> Self {
        Self {
            index,
            current_guard: None,
            leaf: None,
            cursor: 0,
        }
    }

    /// True once the iterator has run off the last leaf.
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Park the cursor on the next live slot, following the chain; the
    /// iterator degrades to the end sentinel when none remains.
    fn skip_to_live_entry(&mut self) -> CorvusResult<()> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(());
            };
            if self.cursor >= leaf.array.len() {
                let next_page_id = leaf.header.next_page_id;
                self.current_guard = None;
                self.leaf = None;
                self.cursor = 0;
                if next_page_id == INVALID_PAGE_ID {
                    return Ok(());
                }
                let guard = self.index.buffer_pool.fetch_page_read(next_page_id)?;
                let (next_leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
                self.current_guard = Some(guard);
                self.leaf = Some(next_leaf);
                continue;
            }
            if leaf.is_tombstone(self.cursor) {
                self.cursor += 1;
                continue;
            }
            return Ok(());
        }
    }

    /// Advance to the next live entry, following the leaf chain. The guard
    /// on a finished leaf is released before its successor is latched.
    pub fn next(&mut self) -> CorvusResult<Option<(K, V)>> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };
            if self.cursor >= leaf.array.len() {
                let next_page_id = leaf.header.next_page_id;
                self.current_guard = None;
                self.leaf = None;
                self.cursor = 0;
                if next_page_id == INVALID_PAGE_ID {
                    return Ok(None);
                }
                let guard = self.index.buffer_pool.fetch_page_read(next_page_id)?;
                let (next_leaf, _) = BPlusTreeLeafPageCodec::decode::<K, V, TOMBS>(guard.data())?;
                self.current_guard = Some(guard);
                self.leaf = Some(next_leaf);
                continue;
            }
            let slot = self.cursor;
            self.cursor += 1;
            if leaf.is_tombstone(slot) {
                continue;
            }
            let entry = leaf.array[slot].clone();
            return Ok(Some(entry));
        }
    }

    /// Drain the remaining entries into a vector.
    pub fn collect_remaining(&mut self) -> CorvusResult<Vec<(K, V)>> {
        let mut out = vec![];
        while let Some(entry) = self.next()? {
            out.push(entry);
        }
        Ok(out)
    }
}
