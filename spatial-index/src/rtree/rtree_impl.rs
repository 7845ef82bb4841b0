//! RTree facade: the tree engine paired with its element mapper.

use std::collections::HashMap;

use crate::crs::CrsDescriptor;
use crate::envelope::Envelope;
use crate::mapper::ElementMapper;

use super::backend::StorageLocation;
use super::persistence::IntegrityReport;
use super::rtree_config::RTreeConfig;
use super::rtree_constants::DEFAULT_CACHE_PAGES;
use super::rtree_engine::TreeEngine;
use super::rtree_search::SearchCursor;
use super::rtree_split::SplitPolicy;
use super::rtree_types::{ElementId, RTreeStats, SpatialError, SpatialResult};

/// A paged R-Tree over caller supplied element ids.
///
/// Every operation takes `&mut self`; wrap the tree in a
/// [`SharedRTree`](crate::SharedRTree) to share it between threads.
///
/// # Examples
///
/// ```rust
/// use spatial_index::{Envelope, MemoryElementMapper, RTree, RTreeConfig, StorageLocation};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RTreeConfig::builder().max_elements(8).build()?;
/// let mut tree = RTree::create(
///     &StorageLocation::memory(1024),
///     config,
///     Box::new(MemoryElementMapper::new()),
/// )?;
///
/// tree.insert(1, Envelope::rect(0.0, 0.0, 10.0, 10.0))?;
/// tree.insert(2, Envelope::rect(20.0, 20.0, 30.0, 30.0))?;
///
/// let hits = tree.search_ids(&Envelope::rect(5.0, 5.0, 15.0, 15.0))?;
/// assert_eq!(hits, vec![1]);
///
/// tree.remove_element(1)?;
/// assert_eq!(tree.len(), 1);
/// tree.close()?;
/// # Ok(())
/// # }
/// ```
pub struct RTree {
    engine: TreeEngine,
    mapper: Box<dyn ElementMapper>,
    closed: bool,
}

impl RTree {
    /// Creates an empty tree at `location`, discarding anything stored there.
    /// The mapper is cleared to match.
    pub fn create(
        location: &StorageLocation,
        config: RTreeConfig,
        mut mapper: Box<dyn ElementMapper>,
    ) -> SpatialResult<Self> {
        let engine = TreeEngine::create(location, config)?;
        mapper.clear()?;
        Ok(RTree {
            engine,
            mapper,
            closed: false,
        })
    }

    /// Opens an existing tree with the default cache size.
    pub fn open(
        location: &StorageLocation,
        split_policy: SplitPolicy,
        mapper: Box<dyn ElementMapper>,
    ) -> SpatialResult<Self> {
        Self::open_with_cache_size(location, split_policy, DEFAULT_CACHE_PAGES, mapper)
    }

    /// Opens an existing tree. A mapper that disagrees with the tree on the
    /// element count is rebuilt from the leaves.
    pub fn open_with_cache_size(
        location: &StorageLocation,
        split_policy: SplitPolicy,
        cache_pages: usize,
        mapper: Box<dyn ElementMapper>,
    ) -> SpatialResult<Self> {
        let engine = TreeEngine::open(location, split_policy, cache_pages)?;
        let mut tree = RTree {
            engine,
            mapper,
            closed: false,
        };
        if tree.mapper.len() as u64 != tree.engine.len() {
            log::warn!(
                "Element mapper holds {} elements but the tree holds {}, resynchronizing",
                tree.mapper.len(),
                tree.engine.len()
            );
            tree.resync_mapper()?;
        }
        Ok(tree)
    }

    fn resync_mapper(&mut self) -> SpatialResult<()> {
        self.mapper.clear()?;
        for entry in self.engine.collect_entries()? {
            self.mapper.set_envelope(entry.id, &entry.envelope)?;
        }
        self.mapper.flush()
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.closed {
            return Err(SpatialError::Closed);
        }
        Ok(())
    }

    fn check_envelope(&self, envelope: &Envelope) -> SpatialResult<()> {
        envelope.validate(self.engine.config().dimension())
    }

    /// Indexes an element. An id that is already indexed is moved to the new
    /// envelope.
    pub fn insert(&mut self, id: ElementId, envelope: Envelope) -> SpatialResult<()> {
        self.check_open()?;
        self.check_envelope(&envelope)?;

        match self.mapper.get_envelope(id) {
            Ok(previous) => {
                // Remove and reinsert succeed or fail together
                if !self.engine.relocate(id, &previous, envelope.clone())? {
                    log::warn!("Element {} was mapped but missing from the tree", id);
                }
            }
            Err(SpatialError::NotFound { .. }) => self.engine.insert(id, envelope.clone())?,
            Err(e) => return Err(e),
        }
        self.mapper.set_envelope(id, &envelope)
    }

    /// Removes the entry matching both `id` and `envelope`.
    pub fn remove(&mut self, id: ElementId, envelope: &Envelope) -> SpatialResult<bool> {
        self.check_open()?;
        self.check_envelope(envelope)?;

        if !self.engine.remove(id, envelope)? {
            return Ok(false);
        }
        self.mapper.remove(id)?;
        Ok(true)
    }

    /// Removes an element by id, looking its envelope up in the mapper.
    pub fn remove_element(&mut self, id: ElementId) -> SpatialResult<bool> {
        self.check_open()?;
        match self.mapper.get_envelope(id) {
            Ok(envelope) => self.remove(id, &envelope),
            Err(SpatialError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lazy search for elements whose envelopes intersect `query`.
    pub fn search(&mut self, query: &Envelope) -> SpatialResult<SearchCursor<'_>> {
        self.check_open()?;
        self.check_envelope(query)?;
        Ok(SearchCursor::new(&mut self.engine, query.clone()))
    }

    /// Ids of every element intersecting `query`, sorted.
    pub fn search_ids(&mut self, query: &Envelope) -> SpatialResult<Vec<ElementId>> {
        let mut ids = self.search(query)?.collect::<SpatialResult<Vec<_>>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Ids of every element lying entirely inside `query`, sorted.
    pub fn find_contained(&mut self, query: &Envelope) -> SpatialResult<Vec<ElementId>> {
        self.check_open()?;
        self.check_envelope(query)?;
        let mut ids = self.engine.find_contained(query)?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// The `k` elements nearest to `point` with their distances, nearest
    /// first, optionally limited to `max_distance`.
    pub fn find_nearest(
        &mut self,
        point: &[f64],
        k: usize,
        max_distance: Option<f64>,
    ) -> SpatialResult<Vec<(ElementId, f64)>> {
        self.check_open()?;
        let dimension = self.engine.config().dimension();
        if point.len() != dimension || point.iter().any(|c| c.is_nan()) {
            return Err(SpatialError::InvalidOperation(format!(
                "query point must have {} non-NaN coordinates",
                dimension
            )));
        }
        if max_distance.is_some_and(|d| d.is_nan() || d < 0.0) {
            return Err(SpatialError::InvalidOperation(
                "max distance must be non-negative".to_string(),
            ));
        }
        self.engine.find_nearest(point, k, max_distance)
    }

    /// Envelope an element is indexed with.
    pub fn envelope_of(&self, id: ElementId) -> SpatialResult<Envelope> {
        self.check_open()?;
        self.mapper.get_envelope(id)
    }

    pub fn contains(&self, id: ElementId) -> bool {
        !self.closed && self.mapper.contains(id)
    }

    pub fn len(&self) -> u64 {
        self.engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    pub fn height(&self) -> usize {
        self.engine.height()
    }

    pub fn crs(&self) -> &CrsDescriptor {
        self.engine.config().crs()
    }

    pub fn config(&self) -> &RTreeConfig {
        self.engine.config()
    }

    pub fn stats(&self) -> RTreeStats {
        self.engine.stats()
    }

    /// Writes dirty nodes, the header and the mapper to their media.
    pub fn flush(&mut self) -> SpatialResult<()> {
        self.check_open()?;
        self.engine.flush()?;
        self.mapper.flush()
    }

    /// Removes every element.
    pub fn clear(&mut self) -> SpatialResult<()> {
        self.check_open()?;
        self.engine.clear()?;
        self.mapper.clear()
    }

    /// Indexes many elements at once. On an empty tree the elements are
    /// packed into a fresh tree in Hilbert order; otherwise they are inserted
    /// in that order. Ids already indexed are moved, and the last envelope
    /// given for a repeated id wins.
    pub fn bulk_load<I>(&mut self, elements: I) -> SpatialResult<()>
    where
        I: IntoIterator<Item = (ElementId, Envelope)>,
    {
        self.check_open()?;

        let mut latest: HashMap<ElementId, Envelope> = HashMap::new();
        for (id, envelope) in elements {
            self.check_envelope(&envelope)?;
            latest.insert(id, envelope);
        }

        let mut previous = Vec::new();
        for id in latest.keys() {
            match self.mapper.get_envelope(*id) {
                Ok(envelope) => previous.push((*id, envelope)),
                Err(SpatialError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let items: Vec<(ElementId, Envelope)> = latest.into_iter().collect();
        self.engine.bulk_replace(previous, items.clone())?;
        for (id, envelope) in &items {
            self.mapper.set_envelope(*id, envelope)?;
        }
        Ok(())
    }

    /// Repacks the tree from its own elements.
    pub fn rebuild(&mut self) -> SpatialResult<()> {
        self.check_open()?;
        self.engine.rebuild()
    }

    /// Verifies tree structure and agreement with the element mapper.
    pub fn check_integrity(&mut self) -> SpatialResult<IntegrityReport> {
        self.check_open()?;
        self.engine.check_integrity(Some(self.mapper.as_ref()))
    }

    /// Flushes everything and releases the storage. Further calls are no-ops;
    /// every other operation fails with `Closed`.
    pub fn close(&mut self) -> SpatialResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let engine = self.engine.close();
        let mapper = self.mapper.close();
        log::debug!("Closed tree with {} elements", self.engine.len());
        engine.and(mapper)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for RTree {
    fn drop(&mut self) {
        // Best effort flush on drop
        if !self.closed {
            if let Err(e) = self.flush() {
                log::warn!("Failed to flush tree on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{FileElementMapper, MemoryElementMapper};
    use crate::rtree::backend::SharedBuffer;
    use tempfile::tempdir;

    fn config(max: usize) -> RTreeConfig {
        RTreeConfig::builder()
            .max_elements(max)
            .page_size(1024)
            .build()
            .unwrap()
    }

    fn memory_tree(max: usize) -> RTree {
        RTree::create(
            &StorageLocation::memory(4096),
            config(max),
            Box::new(MemoryElementMapper::new()),
        )
        .unwrap()
    }

    fn square(x: f64, y: f64) -> Envelope {
        Envelope::rect(x, y, x + 1.0, y + 1.0)
    }

    #[test]
    fn test_insert_search_remove() {
        let mut tree = memory_tree(4);
        for i in 0..30u64 {
            tree.insert(i, square(i as f64 * 2.0, 0.0)).unwrap();
        }
        assert_eq!(tree.len(), 30);
        assert_eq!(tree.search_ids(&Envelope::rect(3.5, 0.0, 8.5, 1.0)).unwrap(), vec![2, 3, 4]);

        assert!(tree.remove_element(3).unwrap());
        assert!(!tree.remove_element(3).unwrap());
        assert!(!tree.remove(4, &square(0.0, 0.0)).unwrap());
        assert_eq!(tree.search_ids(&Envelope::rect(3.5, 0.0, 8.5, 1.0)).unwrap(), vec![2, 4]);

        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_insert_existing_id_moves_it() {
        let mut tree = memory_tree(4);
        tree.insert(7, square(0.0, 0.0)).unwrap();
        tree.insert(7, square(50.0, 50.0)).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.search_ids(&square(0.0, 0.0)).unwrap().is_empty());
        assert_eq!(tree.search_ids(&square(50.0, 50.0)).unwrap(), vec![7]);
        assert_eq!(tree.envelope_of(7).unwrap(), square(50.0, 50.0));
    }

    #[test]
    fn test_failed_move_keeps_mapper_and_tree_in_step() {
        let config = RTreeConfig::builder()
            .split_policy(SplitPolicy::Quadratic)
            .max_elements(4)
            .page_size(1024)
            .build()
            .unwrap();
        // Header, root and two more pages
        let mut tree = RTree::create(
            &StorageLocation::memory(4),
            config,
            Box::new(MemoryElementMapper::new()),
        )
        .unwrap();

        let mut next = 0u64;
        while tree.insert(next, square(next as f64 * 2.0, 0.0)).is_ok() {
            next += 1;
        }
        assert!(!tree.contains(next));
        let count = tree.len();
        assert_eq!(count, next);

        assert!(matches!(
            tree.insert(0, square(500.0, 0.0)),
            Err(SpatialError::Storage(_))
        ));
        assert_eq!(tree.len(), count);
        assert_eq!(tree.envelope_of(0).unwrap(), square(0.0, 0.0));
        assert_eq!(tree.search_ids(&square(0.0, 0.0)).unwrap(), vec![0]);
        assert!(tree.search_ids(&square(500.0, 0.0)).unwrap().is_empty());
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_rejects_bad_envelopes() {
        let mut tree = memory_tree(4);
        assert!(matches!(
            tree.insert(1, Envelope::cube([0.0; 3], [1.0; 3])),
            Err(SpatialError::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.insert(1, Envelope::rect(2.0, 0.0, 1.0, 1.0)),
            Err(SpatialError::InvalidOperation(_))
        ));
        assert!(tree.find_nearest(&[0.0], 1, None).is_err());
        assert!(tree.find_nearest(&[0.0, 0.0], 1, Some(-1.0)).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_closed_tree_rejects_operations() {
        let mut tree = memory_tree(4);
        tree.insert(1, square(0.0, 0.0)).unwrap();
        tree.close().unwrap();
        tree.close().unwrap();
        assert!(tree.is_closed());
        assert!(matches!(tree.insert(2, square(1.0, 1.0)), Err(SpatialError::Closed)));
        assert!(matches!(tree.search_ids(&square(0.0, 0.0)), Err(SpatialError::Closed)));
        assert!(matches!(tree.flush(), Err(SpatialError::Closed)));
        assert!(!tree.contains(1));
    }

    #[test]
    fn test_bulk_load_moves_existing_ids() {
        let mut tree = memory_tree(6);
        tree.insert(1, square(0.0, 0.0)).unwrap();
        tree.bulk_load(vec![
            (1, square(10.0, 10.0)),
            (2, square(20.0, 20.0)),
            (2, square(30.0, 30.0)),
        ])
        .unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.envelope_of(1).unwrap(), square(10.0, 10.0));
        assert_eq!(tree.envelope_of(2).unwrap(), square(30.0, 30.0));
        assert!(tree.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_reopen_resyncs_fresh_mapper() {
        let buffer = SharedBuffer::new();
        let location = StorageLocation::buffer(buffer);
        let mut tree =
            RTree::create(&location, config(4), Box::new(MemoryElementMapper::new())).unwrap();
        for i in 0..20u64 {
            tree.insert(i, square(i as f64, i as f64)).unwrap();
        }
        tree.close().unwrap();

        let mut tree = RTree::open(
            &location,
            SplitPolicy::Quadratic,
            Box::new(MemoryElementMapper::new()),
        )
        .unwrap();
        assert_eq!(tree.len(), 20);
        assert_eq!(tree.envelope_of(5).unwrap(), square(5.0, 5.0));
        assert!(tree.remove_element(5).unwrap());
        assert!(tree.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_file_tree_with_file_mapper() {
        let dir = tempdir().unwrap();
        let location = StorageLocation::file(dir.path().join("tree.rtree"));
        let mapper_path = dir.path().join("tree.map");

        let mut tree = RTree::create(
            &location,
            config(5),
            Box::new(FileElementMapper::open(&mapper_path, 2).unwrap()),
        )
        .unwrap();
        for i in 0..100u64 {
            tree.insert(i, square((i % 10) as f64 * 3.0, (i / 10) as f64 * 3.0)).unwrap();
        }
        for i in (0..100u64).step_by(4) {
            assert!(tree.remove_element(i).unwrap());
        }
        tree.close().unwrap();

        let mut tree = RTree::open(
            &location,
            SplitPolicy::Linear,
            Box::new(FileElementMapper::open(&mapper_path, 2).unwrap()),
        )
        .unwrap();
        assert_eq!(tree.len(), 75);
        assert!(!tree.contains(4));
        assert_eq!(tree.envelope_of(5).unwrap(), square(15.0, 0.0));
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_drop_flushes() {
        let buffer = SharedBuffer::new();
        let location = StorageLocation::buffer(buffer);
        {
            let mut tree =
                RTree::create(&location, config(4), Box::new(MemoryElementMapper::new())).unwrap();
            for i in 0..10u64 {
                tree.insert(i, square(i as f64, 0.0)).unwrap();
            }
        }
        let mut tree = RTree::open(
            &location,
            SplitPolicy::Quadratic,
            Box::new(MemoryElementMapper::new()),
        )
        .unwrap();
        assert_eq!(tree.len(), 10);
        assert_eq!(tree.search_ids(&Envelope::rect(0.0, 0.0, 2.5, 1.0)).unwrap(), vec![0, 1, 2]);
    }
}
