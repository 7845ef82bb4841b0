//! SpatialTree trait definition and a thread-safe tree handle.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::envelope::Envelope;
use crate::rtree::{ElementId, RTree, RTreeStats, SpatialResult};

/// Spatial index operations shared between threads.
///
/// Implementations serialise access internally, so every method takes
/// `&self`.
pub trait SpatialTree: Send + Sync {
    /// Adds an element, moving it if the id is already indexed.
    fn insert(&self, id: ElementId, envelope: Envelope) -> SpatialResult<()>;

    /// Removes the entry matching both id and envelope.
    fn remove(&self, id: ElementId, envelope: &Envelope) -> SpatialResult<bool>;

    /// Removes an element by id.
    fn remove_element(&self, id: ElementId) -> SpatialResult<bool>;

    /// Finds the elements intersecting `query`.
    fn search_ids(&self, query: &Envelope) -> SpatialResult<Vec<ElementId>>;

    /// Finds the elements lying inside `query`.
    fn find_contained(&self, query: &Envelope) -> SpatialResult<Vec<ElementId>>;

    /// Finds the K nearest elements to a point using branch-and-bound search.
    fn find_nearest(
        &self,
        point: &[f64],
        k: usize,
        max_distance: Option<f64>,
    ) -> SpatialResult<Vec<(ElementId, f64)>>;

    /// Finds elements within a specific distance of a point (range query).
    fn find_within_distance(
        &self,
        point: &[f64],
        distance: f64,
    ) -> SpatialResult<Vec<(ElementId, f64)>> {
        self.find_nearest(point, usize::MAX, Some(distance))
    }

    fn envelope_of(&self, id: ElementId) -> SpatialResult<Envelope>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> RTreeStats;

    fn flush(&self) -> SpatialResult<()>;

    fn clear(&self) -> SpatialResult<()>;

    /// Closes the tree, flushing all pending changes.
    fn close(&self) -> SpatialResult<()>;
}

/// Cloneable handle to an [`RTree`] behind a mutex.
#[derive(Clone)]
pub struct SharedRTree {
    inner: Arc<Mutex<RTree>>,
}

impl SharedRTree {
    pub fn new(tree: RTree) -> Self {
        SharedRTree {
            inner: Arc::new(Mutex::new(tree)),
        }
    }

    /// Exclusive access to the tree, e.g. to drive a lazy search cursor.
    pub fn lock(&self) -> MutexGuard<'_, RTree> {
        self.inner.lock()
    }
}

impl From<RTree> for SharedRTree {
    fn from(tree: RTree) -> Self {
        SharedRTree::new(tree)
    }
}

impl SpatialTree for SharedRTree {
    fn insert(&self, id: ElementId, envelope: Envelope) -> SpatialResult<()> {
        self.inner.lock().insert(id, envelope)
    }

    fn remove(&self, id: ElementId, envelope: &Envelope) -> SpatialResult<bool> {
        self.inner.lock().remove(id, envelope)
    }

    fn remove_element(&self, id: ElementId) -> SpatialResult<bool> {
        self.inner.lock().remove_element(id)
    }

    fn search_ids(&self, query: &Envelope) -> SpatialResult<Vec<ElementId>> {
        self.inner.lock().search_ids(query)
    }

    fn find_contained(&self, query: &Envelope) -> SpatialResult<Vec<ElementId>> {
        self.inner.lock().find_contained(query)
    }

    fn find_nearest(
        &self,
        point: &[f64],
        k: usize,
        max_distance: Option<f64>,
    ) -> SpatialResult<Vec<(ElementId, f64)>> {
        self.inner.lock().find_nearest(point, k, max_distance)
    }

    fn envelope_of(&self, id: ElementId) -> SpatialResult<Envelope> {
        self.inner.lock().envelope_of(id)
    }

    fn len(&self) -> u64 {
        self.inner.lock().len()
    }

    fn stats(&self) -> RTreeStats {
        self.inner.lock().stats()
    }

    fn flush(&self) -> SpatialResult<()> {
        self.inner.lock().flush()
    }

    fn clear(&self) -> SpatialResult<()> {
        self.inner.lock().clear()
    }

    fn close(&self) -> SpatialResult<()> {
        self.inner.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MemoryElementMapper;
    use crate::rtree::{RTreeConfig, StorageLocation};
    use std::thread;

    fn shared_tree() -> SharedRTree {
        let config = RTreeConfig::builder().max_elements(8).build().unwrap();
        RTree::create(
            &StorageLocation::memory(4096),
            config,
            Box::new(MemoryElementMapper::new()),
        )
        .unwrap()
        .into()
    }

    #[test]
    fn test_concurrent_inserts() {
        let tree = shared_tree();
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = t * 1000 + i;
                        let x = i as f64;
                        tree.insert(id, Envelope::rect(x, t as f64, x + 0.5, t as f64 + 0.5))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tree.len(), 400);
        let report = tree.lock().check_integrity().unwrap();
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_trait_object_operations() {
        let tree: Box<dyn SpatialTree> = Box::new(shared_tree());
        tree.insert(1, Envelope::rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        tree.insert(2, Envelope::rect(5.0, 5.0, 6.0, 6.0)).unwrap();

        let within = tree.find_within_distance(&[0.0, 0.0], 2.0).unwrap();
        assert_eq!(within, vec![(1, 0.0)]);
        assert_eq!(tree.find_contained(&Envelope::rect(4.0, 4.0, 7.0, 7.0)).unwrap(), vec![2]);
        assert!(tree.remove_element(1).unwrap());
        assert_eq!(tree.len(), 1);

        tree.clear().unwrap();
        assert!(tree.is_empty());
        tree.close().unwrap();
    }

    #[test]
    fn test_lock_allows_lazy_search() {
        let tree = shared_tree();
        for i in 0..20u64 {
            tree.insert(i, Envelope::rect(i as f64, 0.0, i as f64 + 1.0, 1.0)).unwrap();
        }
        let mut guard = tree.lock();
        let first = guard
            .search(&Envelope::rect(0.0, 0.0, 100.0, 1.0))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert!(first < 20);
    }
}
