//! LRU cache of decoded R-Tree nodes.
//!
//! Nodes are only read from the page store when first accessed. Modified
//! nodes stay in the cache as dirty entries and are written back when they
//! are evicted or when the cache is flushed.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::node_codec::{decode_node, encode_node};
use super::rtree_storage::PageStore;
use super::rtree_types::{Node, PageId, SpatialResult};

/// A cached node with its dirty flag
struct CachedNode {
    node: Node,
    dirty: bool,
}

/// Write-back LRU cache for tree nodes
pub struct NodeCache {
    pages: LruCache<PageId, CachedNode>,
    dimension: usize,
    hits: u64,
    misses: u64,
}

impl NodeCache {
    /// Create a new node cache holding at most `max_pages` nodes (at least one)
    pub fn new(max_pages: usize, dimension: usize) -> Self {
        let capacity = NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(capacity),
            dimension,
            hits: 0,
            misses: 0,
        }
    }

    /// Get a node, faulting it in from the store on a miss.
    pub fn get(&mut self, store: &mut PageStore, page_id: PageId) -> SpatialResult<Node> {
        if let Some(cached) = self.pages.get(&page_id) {
            self.hits += 1;
            return Ok(cached.node.clone());
        }

        self.misses += 1;
        let raw = store.read_page(page_id)?;
        let node = decode_node(page_id, &raw, self.dimension)?;
        self.insert(store, page_id, node.clone(), false)?;
        Ok(node)
    }

    /// Store a new or modified node as dirty
    pub fn put(&mut self, store: &mut PageStore, page_id: PageId, node: Node) -> SpatialResult<()> {
        self.insert(store, page_id, node, true)
    }

    /// Mark a cached node as modified. Returns false if it is not cached.
    pub fn mark_dirty(&mut self, page_id: PageId) -> bool {
        match self.pages.get_mut(&page_id) {
            Some(cached) => {
                cached.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Drop a node without writing it back (used for freed pages)
    pub fn discard(&mut self, page_id: PageId) {
        self.pages.pop(&page_id);
    }

    fn insert(
        &mut self,
        store: &mut PageStore,
        page_id: PageId,
        node: Node,
        dirty: bool,
    ) -> SpatialResult<()> {
        if let Some(cached) = self.pages.get_mut(&page_id) {
            cached.node = node;
            cached.dirty |= dirty;
            return Ok(());
        }
        self.make_room(store)?;
        self.pages.put(page_id, CachedNode { node, dirty });
        Ok(())
    }

    /// Evicts least recently used nodes until one slot is free. A dirty node
    /// is written back first; if that fails it stays cached and dirty.
    fn make_room(&mut self, store: &mut PageStore) -> SpatialResult<()> {
        while self.pages.len() >= self.pages.cap().get() {
            let (page_id, bytes) = match self.pages.peek_lru() {
                Some((id, cached)) if cached.dirty => {
                    (*id, Some(encode_node(&cached.node, store.usable_size())?))
                }
                Some((id, _)) => (*id, None),
                None => break,
            };

            if let Some(bytes) = bytes {
                if let Err(e) = store.write_page(page_id, &bytes) {
                    log::error!("Failed to write back evicted page {}: {}", page_id, e);
                    return Err(e);
                }
            }
            self.pages.pop_lru();
        }
        Ok(())
    }

    /// Write every dirty node back to the store
    pub fn flush_all(&mut self, store: &mut PageStore) -> SpatialResult<usize> {
        let mut dirty: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty.sort_unstable();

        for page_id in &dirty {
            if let Some(cached) = self.pages.peek_mut(page_id) {
                let bytes = encode_node(&cached.node, store.usable_size())?;
                if let Err(e) = store.write_page(*page_id, &bytes) {
                    log::error!("Failed to flush page {}: {}", page_id, e);
                    return Err(e);
                }
                cached.dirty = false;
            }
        }
        Ok(dirty.len())
    }

    /// Drop every cached node without write-back
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pages.cap().get()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains(&page_id)
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.pages.peek(&page_id).is_some_and(|c| c.dirty)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::CrsDescriptor;
    use crate::envelope::Envelope;
    use crate::rtree::backend::MemoryBackend;
    use crate::rtree::persistence::TreeHeader;
    use crate::rtree::rtree_split::SplitPolicy;
    use crate::rtree::rtree_types::LeafEntry;

    const PAGE: usize = 1024;

    fn store(pages: usize) -> PageStore {
        let header =
            TreeHeader::new(PAGE, SplitPolicy::Linear, 8, 3, 30, CrsDescriptor::cartesian(2));
        PageStore::create(Box::new(MemoryBackend::new(pages * PAGE)), header).unwrap()
    }

    fn leaf(id: u64) -> Node {
        Node::Leaf {
            parent: 0,
            entries: vec![LeafEntry {
                envelope: Envelope::rect(0.0, 0.0, id as f64, 1.0),
                id,
                hilbert: 0,
            }],
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let mut store = store(16);
        let id = store.allocate_page().unwrap();
        let bytes = encode_node(&leaf(1), store.usable_size()).unwrap();
        store.write_page(id, &bytes).unwrap();

        let mut cache = NodeCache::new(4, 2);
        assert_eq!(cache.get(&mut store, id).unwrap(), leaf(1));
        assert_eq!(cache.get(&mut store, id).unwrap(), leaf(1));
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert!(!cache.is_dirty(id));
    }

    #[test]
    fn test_eviction_writes_back_dirty_nodes() {
        let mut store = store(16);
        let mut cache = NodeCache::new(2, 2);
        let ids: Vec<PageId> = (0..3).map(|_| store.allocate_page().unwrap()).collect();

        for (i, id) in ids.iter().enumerate() {
            cache.put(&mut store, *id, leaf(i as u64)).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(ids[0]));

        // The evicted node must come back from the store intact
        assert_eq!(cache.get(&mut store, ids[0]).unwrap(), leaf(0));
    }

    #[test]
    fn test_capacity_one() {
        let mut store = store(16);
        let mut cache = NodeCache::new(1, 2);
        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();

        cache.put(&mut store, a, leaf(1)).unwrap();
        cache.put(&mut store, b, leaf(2)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&mut store, a).unwrap(), leaf(1));
        assert_eq!(cache.get(&mut store, b).unwrap(), leaf(2));
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_failed_write_back_keeps_entry() {
        let mut store = store(16);
        let mut cache = NodeCache::new(1, 2);
        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        cache.put(&mut store, a, leaf(1)).unwrap();

        store.close().unwrap();
        assert!(cache.put(&mut store, b, leaf(2)).is_err());
        assert!(cache.contains(a));
        assert!(cache.is_dirty(a));
        assert!(!cache.contains(b));
    }

    #[test]
    fn test_flush_all_and_discard() {
        let mut store = store(16);
        let mut cache = NodeCache::new(8, 2);
        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        cache.put(&mut store, a, leaf(1)).unwrap();
        cache.put(&mut store, b, leaf(2)).unwrap();
        cache.discard(b);

        assert_eq!(cache.flush_all(&mut store).unwrap(), 1);
        assert!(!cache.is_dirty(a));
        assert_eq!(cache.flush_all(&mut store).unwrap(), 0);

        let raw = store.read_page(a).unwrap();
        assert_eq!(decode_node(a, &raw, 2).unwrap(), leaf(1));

        assert!(cache.mark_dirty(a));
        assert!(!cache.mark_dirty(b));
        cache.clear();
        assert!(cache.is_empty());
    }
}
