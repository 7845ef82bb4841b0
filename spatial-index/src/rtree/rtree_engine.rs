//! Tree algorithms on top of the node cache and page store.
//!
//! The engine owns the page store and the node cache. Every structural change
//! goes through the cache; nothing reaches the backend until a dirty node is
//! evicted or the engine is flushed.
//!
//! Mutating operations run under an undo journal. Pages freed by an operation
//! only reach the free list once it succeeds; if it fails, touched nodes get
//! their previous content back, pages it allocated are freed and the root,
//! height and element count are restored.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::envelope::Envelope;
use crate::hilbert::HilbertSpace;
use crate::mapper::ElementMapper;

use super::backend::StorageLocation;
use super::persistence::{IntegrityReport, TreeHeader};
use super::rtree_cache::NodeCache;
use super::rtree_config::RTreeConfig;
use super::rtree_constants::{HEADER_PAGE, NO_PAGE};
use super::rtree_split::{split_entries, SplitPolicy};
use super::rtree_storage::PageStore;
use super::rtree_types::{
    ChildRef, ElementId, LeafEntry, Node, PageId, RTreeStats, SpatialError, SpatialResult,
};

/// An entry on its way into a node: an element for leaves, a subtree for
/// internal nodes.
#[derive(Debug, Clone)]
enum NodeEntry {
    Element(LeafEntry),
    Child(ChildRef),
}

impl NodeEntry {
    fn envelope(&self) -> &Envelope {
        match self {
            NodeEntry::Element(e) => &e.envelope,
            NodeEntry::Child(c) => &c.envelope,
        }
    }

    fn key(&self) -> u64 {
        match self {
            NodeEntry::Element(e) => e.hilbert,
            NodeEntry::Child(c) => c.largest_key,
        }
    }
}

fn take_entries(node: &mut Node) -> Vec<NodeEntry> {
    match node {
        Node::Leaf { entries, .. } => std::mem::take(entries)
            .into_iter()
            .map(NodeEntry::Element)
            .collect(),
        Node::Internal { children, .. } => std::mem::take(children)
            .into_iter()
            .map(NodeEntry::Child)
            .collect(),
    }
}

fn children_mut(node: &mut Node, page_id: PageId) -> SpatialResult<&mut Vec<ChildRef>> {
    match node {
        Node::Internal { children, .. } => Ok(children),
        Node::Leaf { .. } => Err(SpatialError::corruption(
            page_id,
            "leaf found where an internal node was expected",
        )),
    }
}

fn child_slot(parent: &Node, parent_id: PageId, child_id: PageId) -> SpatialResult<usize> {
    parent.child_index(child_id).ok_or_else(|| {
        SpatialError::corruption(
            parent_id,
            format!("page {} is not referenced by its parent", child_id),
        )
    })
}

/// Splits `items` into the fewest groups of at most `max` items, as evenly
/// as possible.
fn chunk_evenly<T>(items: Vec<T>, max: usize) -> Vec<Vec<T>> {
    let n = items.len();
    let groups = n.div_ceil(max).max(1);
    let base = n / groups;
    let extra = n % groups;

    let mut out = Vec::with_capacity(groups);
    let mut iter = items.into_iter();
    for g in 0..groups {
        let size = base + usize::from(g < extra);
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// Best-first search queue item, ordered so that `BinaryHeap` pops the
/// closest first.
struct Candidate {
    distance: f64,
    item: CandidateItem,
}

enum CandidateItem {
    Page(PageId),
    Element(ElementId),
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other.distance.total_cmp(&self.distance)
    }
}

/// Undo information for the operation in progress.
struct Journal {
    root: PageId,
    height: u16,
    element_count: u64,
    /// Content of pre-existing pages before their first change
    before: HashMap<PageId, Node>,
    allocated: HashSet<PageId>,
    /// Frees deferred until the operation succeeds
    released: Vec<PageId>,
}

impl Journal {
    fn new(header: &TreeHeader) -> Self {
        Journal {
            root: header.root,
            height: header.height,
            element_count: header.element_count,
            before: HashMap::new(),
            allocated: HashSet::new(),
            released: Vec::new(),
        }
    }

    fn tracks(&self, page_id: PageId) -> bool {
        self.allocated.contains(&page_id) || self.before.contains_key(&page_id)
    }
}

pub struct TreeEngine {
    store: PageStore,
    cache: NodeCache,
    config: RTreeConfig,
    space: Option<HilbertSpace>,
    splits: u64,
    journal: Option<Journal>,
}

impl TreeEngine {
    /// Creates an empty tree: a single empty root leaf.
    pub fn create(location: &StorageLocation, config: RTreeConfig) -> SpatialResult<Self> {
        let backend = location.create_backend(config.page_size())?;
        let header = TreeHeader::new(
            config.page_size(),
            config.split_policy(),
            config.max_elements(),
            config.min_elements(),
            config.reinsert_percent(),
            config.crs().clone(),
        );
        let store = PageStore::create(backend, header)?;
        let mut engine = Self::assemble(store, config)?;

        let root = engine.store.allocate_page()?;
        engine.save(root, Node::empty_leaf(NO_PAGE))?;
        let header = engine.store.header_mut();
        header.root = root;
        header.height = 1;
        engine.flush()?;

        log::debug!(
            "Created {:?} tree (max {}, min {}) with root page {}",
            engine.config.split_policy(),
            engine.config.max_elements(),
            engine.config.min_elements(),
            root
        );
        Ok(engine)
    }

    /// Opens an existing tree. `split_policy` must belong to the same tree
    /// family the store was created with; linear and quadratic may be
    /// swapped.
    pub fn open(
        location: &StorageLocation,
        split_policy: SplitPolicy,
        cache_pages: usize,
    ) -> SpatialResult<Self> {
        let backend = location.open_backend()?;
        let mut store = PageStore::open(backend)?;

        let stored = store.header().split_policy;
        if stored.family() != split_policy.family() {
            return Err(SpatialError::FormatMismatch {
                field: "tree family",
                expected: format!("{:?}", split_policy.family()),
                actual: format!("{:?}", stored.family()),
            });
        }
        if stored != split_policy {
            log::debug!("Opening {:?} tree with {:?} splits", stored, split_policy);
            store.header_mut().split_policy = split_policy;
        }

        let header = store.header();
        if header.root == NO_PAGE || header.height == 0 {
            return Err(SpatialError::corruption(HEADER_PAGE, "header has no root page"));
        }

        let config = RTreeConfig::from_header(header, cache_pages);
        let engine = Self::assemble(store, config)?;
        log::debug!(
            "Opened {:?} tree with {} elements, height {}",
            split_policy,
            engine.len(),
            engine.height()
        );
        Ok(engine)
    }

    fn assemble(store: PageStore, config: RTreeConfig) -> SpatialResult<Self> {
        let space = if config.split_policy() == SplitPolicy::Hilbert {
            let domain = config.crs().domain.clone().ok_or_else(|| {
                SpatialError::InvalidConfig("Hilbert trees need a CRS domain".to_string())
            })?;
            Some(HilbertSpace::new(domain))
        } else {
            None
        };
        let cache = NodeCache::new(config.cache_pages(), config.dimension());

        Ok(TreeEngine {
            store,
            cache,
            config,
            space,
            splits: 0,
            journal: None,
        })
    }

    pub fn config(&self) -> &RTreeConfig {
        &self.config
    }

    pub fn len(&self) -> u64 {
        self.store.header().element_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.store.header().height as usize
    }

    pub fn root(&self) -> PageId {
        self.store.header().root
    }

    fn dimension(&self) -> usize {
        self.config.dimension()
    }

    fn is_hilbert(&self) -> bool {
        self.space.is_some()
    }

    /// Hilbert key of an envelope; zero outside Hilbert trees.
    pub fn hilbert_key(&self, envelope: &Envelope) -> u64 {
        self.space.as_ref().map_or(0, |s| s.key(envelope))
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    pub(crate) fn load(&mut self, page_id: PageId) -> SpatialResult<Node> {
        self.cache.get(&mut self.store, page_id)
    }

    fn save(&mut self, page_id: PageId, node: Node) -> SpatialResult<()> {
        self.remember(page_id)?;
        self.cache.put(&mut self.store, page_id, node)
    }

    fn allocate(&mut self) -> SpatialResult<PageId> {
        let page_id = self.store.allocate_page()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.allocated.insert(page_id);
        }
        Ok(page_id)
    }

    /// Frees a page, dropping any cached copy. Inside an operation the page
    /// only joins the free list once the operation succeeds.
    fn release(&mut self, page_id: PageId) -> SpatialResult<()> {
        self.remember(page_id)?;
        self.cache.discard(page_id);
        match self.journal.as_mut() {
            Some(journal) => {
                journal.released.push(page_id);
                Ok(())
            }
            None => self.store.free_page(page_id),
        }
    }

    /// Records the current content of a pre-existing page before the running
    /// operation changes it for the first time.
    fn remember(&mut self, page_id: PageId) -> SpatialResult<()> {
        match &self.journal {
            Some(journal) if !journal.tracks(page_id) => {}
            _ => return Ok(()),
        }
        let node = self.load(page_id)?;
        if let Some(journal) = self.journal.as_mut() {
            journal.before.insert(page_id, node);
        }
        Ok(())
    }

    /// Runs `op` as one unit: on error every change it made is undone.
    /// Nested calls join the outer unit.
    fn atomically<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> SpatialResult<T>,
    ) -> SpatialResult<T> {
        if self.journal.is_some() {
            return op(self);
        }
        self.journal = Some(Journal::new(self.store.header()));
        let result = op(self);
        let Some(journal) = self.journal.take() else {
            return result;
        };

        match result {
            Ok(value) => {
                self.commit(journal);
                Ok(value)
            }
            Err(e) => {
                if let Err(undo) = self.roll_back(journal) {
                    log::error!("Failed to undo a failed operation ({}): {}", e, undo);
                }
                Err(e)
            }
        }
    }

    fn commit(&mut self, journal: Journal) {
        for (done, page_id) in journal.released.iter().enumerate() {
            if let Err(e) = self.store.free_page(*page_id) {
                // The remaining pages stay allocated but unreferenced
                log::warn!(
                    "Could not free {} pages from page {} on: {}",
                    journal.released.len() - done,
                    page_id,
                    e
                );
                return;
            }
        }
    }

    fn roll_back(&mut self, journal: Journal) -> SpatialResult<()> {
        let header = self.store.header_mut();
        header.root = journal.root;
        header.height = journal.height;
        header.element_count = journal.element_count;

        for page_id in &journal.allocated {
            self.cache.discard(*page_id);
        }
        for (page_id, node) in journal.before {
            self.cache.put(&mut self.store, page_id, node)?;
        }
        for page_id in journal.allocated {
            self.store.free_page(page_id)?;
        }
        log::debug!("Rolled back a failed operation");
        Ok(())
    }

    fn set_parent(&mut self, page_id: PageId, parent: PageId) -> SpatialResult<()> {
        let mut node = self.load(page_id)?;
        if node.parent() != parent {
            node.set_parent(parent);
            self.save(page_id, node)?;
        }
        Ok(())
    }

    fn child_ref(&self, page_id: PageId, node: &Node) -> ChildRef {
        ChildRef {
            envelope: node.compute_envelope(self.dimension()),
            page_id,
            largest_key: node.largest_key(),
        }
    }

    /// Adds an entry to a node of the matching kind. Hilbert trees keep
    /// entries sorted by key.
    fn push_entry(&self, node: &mut Node, page_id: PageId, entry: NodeEntry) -> SpatialResult<()> {
        let hilbert = self.is_hilbert();
        match (node, entry) {
            (Node::Leaf { entries, .. }, NodeEntry::Element(e)) => {
                let pos = if hilbert {
                    entries.partition_point(|x| x.hilbert <= e.hilbert)
                } else {
                    entries.len()
                };
                entries.insert(pos, e);
                Ok(())
            }
            (Node::Internal { children, .. }, NodeEntry::Child(c)) => {
                let pos = if hilbert {
                    children.partition_point(|x| x.largest_key <= c.largest_key)
                } else {
                    children.len()
                };
                children.insert(pos, c);
                Ok(())
            }
            _ => Err(SpatialError::corruption(
                page_id,
                "entry kind does not match node level",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts an element. The caller guarantees the envelope is valid for
    /// the tree's dimension.
    pub fn insert(&mut self, id: ElementId, envelope: Envelope) -> SpatialResult<()> {
        self.atomically(|engine| engine.insert_element(id, envelope))
    }

    /// Moves an element from `previous` to `envelope` in one unit. Returns
    /// whether the old entry was found.
    pub fn relocate(
        &mut self,
        id: ElementId,
        previous: &Envelope,
        envelope: Envelope,
    ) -> SpatialResult<bool> {
        self.atomically(|engine| {
            let found = engine.remove_entry(id, previous)?;
            engine.insert_element(id, envelope)?;
            Ok(found)
        })
    }

    fn insert_element(&mut self, id: ElementId, envelope: Envelope) -> SpatialResult<()> {
        let hilbert = self.hilbert_key(&envelope);
        let entry = LeafEntry {
            envelope,
            id,
            hilbert,
        };
        self.insert_at_level(NodeEntry::Element(entry), 0)?;
        self.store.header_mut().element_count += 1;
        Ok(())
    }

    /// Inserts one entry, then every entry displaced by forced reinsertion.
    fn insert_at_level(&mut self, entry: NodeEntry, level: u16) -> SpatialResult<()> {
        let mut reinserted = 0u64;
        let mut pending = VecDeque::new();
        pending.push_back((entry, level));
        while let Some((entry, level)) = pending.pop_front() {
            self.insert_entry(entry, level, &mut reinserted, &mut pending)?;
        }
        Ok(())
    }

    fn insert_entry(
        &mut self,
        entry: NodeEntry,
        level: u16,
        reinserted: &mut u64,
        pending: &mut VecDeque<(NodeEntry, u16)>,
    ) -> SpatialResult<()> {
        let (page_id, mut node) = self.choose_node(entry.envelope(), entry.key(), level)?;
        if let NodeEntry::Child(child) = &entry {
            self.set_parent(child.page_id, page_id)?;
        }
        self.push_entry(&mut node, page_id, entry)?;
        self.resolve_overflow(page_id, node, reinserted, pending)
    }

    /// Descends from the root to the node at `level` best suited for an
    /// entry.
    fn choose_node(
        &mut self,
        envelope: &Envelope,
        key: u64,
        level: u16,
    ) -> SpatialResult<(PageId, Node)> {
        let mut page_id = self.root();
        let mut node = self.load(page_id)?;

        while node.level() > level {
            let next = match &node {
                Node::Internal { children, .. } if !children.is_empty() => {
                    children[self.choose_subtree(&node, envelope, key)].page_id
                }
                _ => {
                    return Err(SpatialError::corruption(
                        page_id,
                        "internal node without children",
                    ))
                }
            };
            page_id = next;
            node = self.load(page_id)?;
        }

        if node.level() != level {
            return Err(SpatialError::corruption(
                page_id,
                format!("expected a node at level {}, found level {}", level, node.level()),
            ));
        }
        Ok((page_id, node))
    }

    fn choose_subtree(&self, node: &Node, envelope: &Envelope, key: u64) -> usize {
        let Node::Internal {
            children, level, ..
        } = node
        else {
            return 0;
        };

        if self.is_hilbert() {
            return children
                .iter()
                .position(|c| c.largest_key >= key)
                .unwrap_or(children.len() - 1);
        }

        if self.config.split_policy() == SplitPolicy::RStar && *level == 1 {
            return least_overlap_enlargement(children, envelope);
        }
        least_enlargement(children, envelope)
    }

    /// Saves a node that fits, or treats its overflow, repeating upward as
    /// long as splits overflow the parent.
    fn resolve_overflow(
        &mut self,
        mut page_id: PageId,
        mut node: Node,
        reinserted: &mut u64,
        pending: &mut VecDeque<(NodeEntry, u16)>,
    ) -> SpatialResult<()> {
        loop {
            if node.len() <= self.config.max_elements() {
                return self.save_and_propagate(page_id, node);
            }

            let level = node.level();
            let bit = 1u64 << u32::from(level).min(63);
            if self.config.split_policy() == SplitPolicy::RStar
                && !node.is_root()
                && *reinserted & bit == 0
            {
                *reinserted |= bit;
                return self.forced_reinsert(page_id, node, pending);
            }

            if self.is_hilbert() && !node.is_root() {
                match self.redistribute(page_id, node)? {
                    None => return Ok(()),
                    Some(unchanged) => node = unchanged,
                }
            }

            match self.split(page_id, node)? {
                Some((parent_id, parent)) => {
                    page_id = parent_id;
                    node = parent;
                }
                None => return Ok(()),
            }
        }
    }

    /// Saves a node and refreshes the envelopes and keys of its ancestors.
    fn save_and_propagate(&mut self, page_id: PageId, node: Node) -> SpatialResult<()> {
        let envelope = node.compute_envelope(self.dimension());
        let key = node.largest_key();
        let parent = node.parent();
        self.save(page_id, node)?;
        self.propagate(page_id, parent, envelope, key)
    }

    fn propagate(
        &mut self,
        mut child_id: PageId,
        mut parent_id: PageId,
        mut envelope: Envelope,
        mut key: u64,
    ) -> SpatialResult<()> {
        while parent_id != NO_PAGE {
            let mut parent = self.load(parent_id)?;
            let idx = child_slot(&parent, parent_id, child_id)?;
            let children = children_mut(&mut parent, parent_id)?;
            if children[idx].envelope == envelope && children[idx].largest_key == key {
                // Ancestors are already up to date
                return Ok(());
            }
            children[idx].envelope = envelope;
            children[idx].largest_key = key;

            envelope = parent.compute_envelope(self.dimension());
            key = parent.largest_key();
            let next = parent.parent();
            self.save(parent_id, parent)?;
            child_id = parent_id;
            parent_id = next;
        }
        Ok(())
    }

    /// R*-Tree overflow treatment: evicts the entries farthest from the node
    /// centre and queues them for reinsertion, closest first.
    fn forced_reinsert(
        &mut self,
        page_id: PageId,
        mut node: Node,
        pending: &mut VecDeque<(NodeEntry, u16)>,
    ) -> SpatialResult<()> {
        let level = node.level();
        let center = node.compute_envelope(self.dimension());
        let count = self.config.reinsert_count();

        let mut entries = take_entries(&mut node);
        entries.sort_by(|a, b| {
            b.envelope()
                .center_distance_sq(&center)
                .total_cmp(&a.envelope().center_distance_sq(&center))
        });
        let evicted: Vec<NodeEntry> = entries.drain(..count).collect();
        for e in entries {
            self.push_entry(&mut node, page_id, e)?;
        }

        log::debug!(
            "Forced reinsert of {} entries from page {} at level {}",
            evicted.len(),
            page_id,
            level
        );
        self.save_and_propagate(page_id, node)?;

        for e in evicted.into_iter().rev() {
            pending.push_back((e, level));
        }
        Ok(())
    }

    /// Hilbert deferred split: shares entries with an adjacent sibling that
    /// has room. Gives the node back when no sibling can help.
    fn redistribute(&mut self, page_id: PageId, node: Node) -> SpatialResult<Option<Node>> {
        let max = self.config.max_elements();
        let parent_id = node.parent();
        let mut parent = self.load(parent_id)?;
        let idx = child_slot(&parent, parent_id, page_id)?;
        let siblings: Vec<(usize, PageId)> = {
            let children = children_mut(&mut parent, parent_id)?;
            let mut candidates = Vec::with_capacity(2);
            if idx + 1 < children.len() {
                candidates.push((idx + 1, children[idx + 1].page_id));
            }
            if idx > 0 {
                candidates.push((idx - 1, children[idx - 1].page_id));
            }
            candidates
        };

        let mut chosen = None;
        for (sibling_idx, sibling_id) in siblings {
            let sibling = self.load(sibling_id)?;
            if sibling.len() < max {
                chosen = Some((sibling_idx, sibling_id, sibling));
                break;
            }
        }
        let Some((sibling_idx, sibling_id, sibling)) = chosen else {
            return Ok(Some(node));
        };

        let (left_idx, left_id, mut left, right_id, mut right) = if sibling_idx > idx {
            (idx, page_id, node, sibling_id, sibling)
        } else {
            (sibling_idx, sibling_id, sibling, page_id, node)
        };

        let mut all = take_entries(&mut left);
        all.extend(take_entries(&mut right));
        let moved = all.split_off(all.len().div_ceil(2));
        for e in all {
            if let NodeEntry::Child(c) = &e {
                self.set_parent(c.page_id, left_id)?;
            }
            self.push_entry(&mut left, left_id, e)?;
        }
        for e in moved {
            if let NodeEntry::Child(c) = &e {
                self.set_parent(c.page_id, right_id)?;
            }
            self.push_entry(&mut right, right_id, e)?;
        }

        let left_ref = self.child_ref(left_id, &left);
        let right_ref = self.child_ref(right_id, &right);
        {
            let children = children_mut(&mut parent, parent_id)?;
            children[left_idx] = left_ref;
            children[left_idx + 1] = right_ref;
        }
        self.save(left_id, left)?;
        self.save(right_id, right)?;
        self.save_and_propagate(parent_id, parent)?;
        Ok(None)
    }

    /// Splits an overflowing node. Returns the parent, updated in memory but
    /// not saved, when it must be checked for overflow; `None` after a root
    /// split.
    fn split(&mut self, page_id: PageId, node: Node) -> SpatialResult<Option<(PageId, Node)>> {
        let level = node.level();
        let parent_id = node.parent();
        let was_root = node.is_root();
        let policy = self.config.split_policy();
        let min = self.config.min_elements();
        let dimension = self.dimension();

        let new_id = self.allocate()?;
        let (mut first, mut second) = match node {
            Node::Leaf { entries, .. } => {
                let (a, b) = split_entries(entries, policy, min, dimension);
                (
                    Node::Leaf {
                        parent: parent_id,
                        entries: a,
                    },
                    Node::Leaf {
                        parent: parent_id,
                        entries: b,
                    },
                )
            }
            Node::Internal {
                children, level, ..
            } => {
                let (a, b) = split_entries(children, policy, min, dimension);
                for c in &b {
                    self.set_parent(c.page_id, new_id)?;
                }
                (
                    Node::Internal {
                        parent: parent_id,
                        level,
                        children: a,
                    },
                    Node::Internal {
                        parent: parent_id,
                        level,
                        children: b,
                    },
                )
            }
        };
        self.splits += 1;
        log::debug!(
            "Split page {} at level {} into {} + {} entries (new page {})",
            page_id,
            level,
            first.len(),
            second.len(),
            new_id
        );

        if was_root {
            let root_id = self.allocate()?;
            first.set_parent(root_id);
            second.set_parent(root_id);
            let root = Node::Internal {
                parent: NO_PAGE,
                level: level + 1,
                children: vec![self.child_ref(page_id, &first), self.child_ref(new_id, &second)],
            };
            self.save(page_id, first)?;
            self.save(new_id, second)?;
            self.save(root_id, root)?;

            let header = self.store.header_mut();
            header.root = root_id;
            header.height += 1;
            log::debug!(
                "Root split: new root page {}, tree height is now {}",
                root_id,
                header.height
            );
            return Ok(None);
        }

        let first_ref = self.child_ref(page_id, &first);
        let second_ref = self.child_ref(new_id, &second);
        self.save(page_id, first)?;
        self.save(new_id, second)?;

        let mut parent = self.load(parent_id)?;
        let idx = child_slot(&parent, parent_id, page_id)?;
        let children = children_mut(&mut parent, parent_id)?;
        children[idx] = first_ref;
        children.insert(idx + 1, second_ref);
        Ok(Some((parent_id, parent)))
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Removes the entry matching both `id` and `envelope`. Returns false if
    /// there is no such entry.
    pub fn remove(&mut self, id: ElementId, envelope: &Envelope) -> SpatialResult<bool> {
        self.atomically(|engine| engine.remove_entry(id, envelope))
    }

    fn remove_entry(&mut self, id: ElementId, envelope: &Envelope) -> SpatialResult<bool> {
        let Some((page_id, mut leaf, idx)) = self.find_leaf(id, envelope)? else {
            return Ok(false);
        };
        if let Node::Leaf { entries, .. } = &mut leaf {
            entries.remove(idx);
        }
        let header = self.store.header_mut();
        header.element_count = header.element_count.saturating_sub(1);
        self.condense(page_id, leaf)?;
        Ok(true)
    }

    fn find_leaf(
        &mut self,
        id: ElementId,
        envelope: &Envelope,
    ) -> SpatialResult<Option<(PageId, Node, usize)>> {
        let mut stack = vec![self.root()];
        while let Some(page_id) = stack.pop() {
            let node = self.load(page_id)?;
            match &node {
                Node::Leaf { entries, .. } => {
                    if let Some(idx) = entries
                        .iter()
                        .position(|e| e.id == id && e.envelope == *envelope)
                    {
                        return Ok(Some((page_id, node, idx)));
                    }
                }
                Node::Internal { children, .. } => {
                    for c in children {
                        if c.envelope.contains(envelope) {
                            stack.push(c.page_id);
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Walks from a shrunken node to the root, removing underfull nodes and
    /// refreshing envelopes, then reinserts whatever the removed nodes held.
    fn condense(&mut self, page_id: PageId, node: Node) -> SpatialResult<()> {
        let min = self.config.min_elements();
        let mut orphans = Vec::new();
        let (mut page_id, mut node) = (page_id, node);

        while !node.is_root() {
            let parent_id = node.parent();
            let mut parent = self.load(parent_id)?;
            let idx = child_slot(&parent, parent_id, page_id)?;

            if node.len() < min {
                children_mut(&mut parent, parent_id)?.remove(idx);
                self.release(page_id)?;
                orphans.push(node);
            } else {
                let child = self.child_ref(page_id, &node);
                children_mut(&mut parent, parent_id)?[idx] = child;
                self.save(page_id, node)?;
            }
            page_id = parent_id;
            node = parent;
        }
        self.save(page_id, node)?;
        self.shrink_root()?;

        if !orphans.is_empty() {
            log::debug!("Reinserting the contents of {} underfull nodes", orphans.len());
        }
        for orphan in orphans {
            self.reinsert_orphan(orphan)?;
        }
        Ok(())
    }

    fn reinsert_orphan(&mut self, node: Node) -> SpatialResult<()> {
        let level = node.level();
        match node {
            Node::Leaf { entries, .. } => {
                for e in entries {
                    self.insert_at_level(NodeEntry::Element(e), 0)?;
                }
            }
            Node::Internal { children, .. } => {
                let root_level = self.height().saturating_sub(1) as u16;
                if !self.is_hilbert() && root_level >= level {
                    for c in children {
                        self.insert_at_level(NodeEntry::Child(c), level)?;
                    }
                } else {
                    // Subtrees cannot be placed whole: push their elements
                    // back in one by one
                    for c in children {
                        for e in self.drain_subtree(c.page_id)? {
                            self.insert_at_level(NodeEntry::Element(e), 0)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Collects every element below `page_id` and frees the subtree's pages.
    fn drain_subtree(&mut self, page_id: PageId) -> SpatialResult<Vec<LeafEntry>> {
        let mut out = Vec::new();
        let mut stack = vec![page_id];
        while let Some(page_id) = stack.pop() {
            match self.load(page_id)? {
                Node::Leaf { entries, .. } => out.extend(entries),
                Node::Internal { children, .. } => {
                    stack.extend(children.iter().map(|c| c.page_id));
                }
            }
            self.release(page_id)?;
        }
        Ok(out)
    }

    /// Collapses a root with a single child and resets a root left with no
    /// children to an empty leaf.
    fn shrink_root(&mut self) -> SpatialResult<()> {
        loop {
            let root_id = self.root();
            match self.load(root_id)? {
                Node::Internal { children, .. } if children.len() == 1 => {
                    let child_id = children[0].page_id;
                    self.set_parent(child_id, NO_PAGE)?;
                    self.release(root_id)?;
                    let header = self.store.header_mut();
                    header.root = child_id;
                    header.height = header.height.saturating_sub(1).max(1);
                    log::debug!(
                        "Collapsed root {} into {}, tree height is now {}",
                        root_id,
                        child_id,
                        header.height
                    );
                }
                Node::Internal { children, .. } if children.is_empty() => {
                    self.save(root_id, Node::empty_leaf(NO_PAGE))?;
                    self.store.header_mut().height = 1;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Elements whose envelopes lie entirely inside `query`.
    pub fn find_contained(&mut self, query: &Envelope) -> SpatialResult<Vec<ElementId>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(page_id) = stack.pop() {
            match self.load(page_id)? {
                Node::Leaf { entries, .. } => {
                    out.extend(
                        entries
                            .iter()
                            .filter(|e| query.contains(&e.envelope))
                            .map(|e| e.id),
                    );
                }
                Node::Internal { children, .. } => {
                    stack.extend(
                        children
                            .iter()
                            .filter(|c| c.envelope.intersects(query))
                            .map(|c| c.page_id),
                    );
                }
            }
        }
        Ok(out)
    }

    /// Up to `k` elements closest to `point`, nearest first, using best-first
    /// branch and bound.
    pub fn find_nearest(
        &mut self,
        point: &[f64],
        k: usize,
        max_distance: Option<f64>,
    ) -> SpatialResult<Vec<(ElementId, f64)>> {
        let mut results = Vec::with_capacity(k.min(1024));
        if k == 0 {
            return Ok(results);
        }
        let limit = max_distance.unwrap_or(f64::INFINITY);

        let mut heap = BinaryHeap::new();
        heap.push(Candidate {
            distance: 0.0,
            item: CandidateItem::Page(self.root()),
        });

        while let Some(candidate) = heap.pop() {
            if candidate.distance > limit {
                break;
            }
            match candidate.item {
                CandidateItem::Element(id) => {
                    results.push((id, candidate.distance));
                    if results.len() == k {
                        break;
                    }
                }
                CandidateItem::Page(page_id) => match self.load(page_id)? {
                    Node::Leaf { entries, .. } => {
                        for e in entries {
                            let distance = e.envelope.min_distance(point);
                            if distance <= limit {
                                heap.push(Candidate {
                                    distance,
                                    item: CandidateItem::Element(e.id),
                                });
                            }
                        }
                    }
                    Node::Internal { children, .. } => {
                        for c in children {
                            let distance = c.envelope.min_distance(point);
                            if distance <= limit {
                                heap.push(Candidate {
                                    distance,
                                    item: CandidateItem::Page(c.page_id),
                                });
                            }
                        }
                    }
                },
            }
        }
        Ok(results)
    }

    /// Every element in the tree, in leaf order.
    pub fn collect_entries(&mut self) -> SpatialResult<Vec<LeafEntry>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(page_id) = stack.pop() {
            match self.load(page_id)? {
                Node::Leaf { entries, .. } => out.extend(entries),
                Node::Internal { children, .. } => {
                    stack.extend(children.iter().rev().map(|c| c.page_id));
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Whole-tree operations
    // ------------------------------------------------------------------

    /// Removes every element, freeing all pages but the root.
    pub fn clear(&mut self) -> SpatialResult<()> {
        self.atomically(Self::clear_pages)
    }

    fn clear_pages(&mut self) -> SpatialResult<()> {
        let root = self.root();
        let mut stack = vec![root];
        while let Some(page_id) = stack.pop() {
            if let Node::Internal { children, .. } = self.load(page_id)? {
                stack.extend(children.iter().map(|c| c.page_id));
            }
            if page_id != root {
                self.release(page_id)?;
            }
        }
        self.save(root, Node::empty_leaf(NO_PAGE))?;
        let header = self.store.header_mut();
        header.height = 1;
        header.element_count = 0;
        log::debug!("Cleared tree, root page {}", root);
        Ok(())
    }

    /// Removes the `previous` entries, then loads `items`, as one unit.
    pub fn bulk_replace(
        &mut self,
        previous: Vec<(ElementId, Envelope)>,
        items: Vec<(ElementId, Envelope)>,
    ) -> SpatialResult<()> {
        self.atomically(|engine| {
            for (id, envelope) in &previous {
                engine.remove_entry(*id, envelope)?;
            }
            engine.load_sorted(items)
        })
    }

    /// Loads many elements at once. An empty tree is packed bottom-up from
    /// the elements sorted by Hilbert key; otherwise the sorted elements are
    /// inserted one by one.
    fn load_sorted(&mut self, items: Vec<(ElementId, Envelope)>) -> SpatialResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let sort_space = match &self.space {
            Some(space) => space.clone(),
            None => {
                let mut domain = Envelope::empty(self.dimension());
                for (_, envelope) in &items {
                    domain.expand(envelope);
                }
                HilbertSpace::new(domain)
            }
        };
        let mut keyed: Vec<(u64, LeafEntry)> = items
            .into_iter()
            .map(|(id, envelope)| {
                let hilbert = self.hilbert_key(&envelope);
                (
                    sort_space.key(&envelope),
                    LeafEntry {
                        envelope,
                        id,
                        hilbert,
                    },
                )
            })
            .collect();
        keyed.sort_by_key(|(key, _)| *key);
        let count = keyed.len() as u64;
        let entries: Vec<LeafEntry> = keyed.into_iter().map(|(_, e)| e).collect();

        if !self.is_empty() {
            for e in entries {
                self.insert_at_level(NodeEntry::Element(e), 0)?;
                self.store.header_mut().element_count += 1;
            }
            return Ok(());
        }

        self.pack(entries)?;
        self.store.header_mut().element_count = count;
        log::debug!(
            "Bulk loaded {} elements, tree height {}",
            count,
            self.height()
        );
        Ok(())
    }

    /// Builds the tree level by level from sorted leaf entries, replacing the
    /// empty root.
    fn pack(&mut self, entries: Vec<LeafEntry>) -> SpatialResult<()> {
        let old_root = self.root();
        self.release(old_root)?;

        let max = self.config.max_elements();
        let mut level = 0u16;
        let mut items: Vec<NodeEntry> = entries.into_iter().map(NodeEntry::Element).collect();

        loop {
            let groups = chunk_evenly(items, max);
            let top = groups.len() == 1;
            let mut refs = Vec::with_capacity(groups.len());

            for group in groups {
                let page_id = self.allocate()?;
                let mut node = if level == 0 {
                    Node::empty_leaf(NO_PAGE)
                } else {
                    Node::Internal {
                        parent: NO_PAGE,
                        level,
                        children: Vec::with_capacity(group.len()),
                    }
                };
                for e in group {
                    if let NodeEntry::Child(c) = &e {
                        self.set_parent(c.page_id, page_id)?;
                    }
                    self.push_entry(&mut node, page_id, e)?;
                }
                refs.push(self.child_ref(page_id, &node));
                self.save(page_id, node)?;
            }

            if top {
                let header = self.store.header_mut();
                header.root = refs[0].page_id;
                header.height = level + 1;
                return Ok(());
            }
            items = refs.into_iter().map(NodeEntry::Child).collect();
            level += 1;
        }
    }

    /// Rebuilds the tree from its own elements with bulk loading.
    pub fn rebuild(&mut self) -> SpatialResult<()> {
        let entries = self.collect_entries()?;
        self.atomically(|engine| {
            engine.clear_pages()?;
            engine.load_sorted(entries.into_iter().map(|e| (e.id, e.envelope)).collect())
        })
    }

    pub fn stats(&self) -> RTreeStats {
        let header = self.store.header();
        RTreeStats {
            total_entries: header.element_count,
            cached_pages: self.cache.len() as u64,
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            disk_reads: self.store.reads(),
            disk_writes: self.store.writes(),
            tree_height: u32::from(header.height),
            splits: self.splits,
            allocated_pages: header.allocated_pages(),
            free_pages: header.free_page_count,
        }
    }

    /// Verifies every structural property of the tree. Problems are reported,
    /// not returned as errors; only failures of the check itself are.
    pub fn check_integrity(
        &mut self,
        mapper: Option<&dyn ElementMapper>,
    ) -> SpatialResult<IntegrityReport> {
        let mut report = IntegrityReport::new();
        let header = self.store.header().clone();
        let max = self.config.max_elements();
        let min = self.config.min_elements();
        let dimension = self.dimension();
        let hilbert = self.is_hilbert();

        let mut reachable = HashSet::new();
        let mut seen_ids = HashSet::new();
        let mut last_key: Option<u64> = None;
        let mut stack: Vec<(PageId, PageId, u16, Option<ChildRef>)> =
            vec![(header.root, NO_PAGE, header.height.saturating_sub(1), None)];

        while let Some((page_id, parent, level, expected)) = stack.pop() {
            if !reachable.insert(page_id) {
                report.error(format!("page {} is referenced more than once", page_id));
                continue;
            }
            let node = match self.load(page_id) {
                Ok(node) => node,
                Err(e) => {
                    report.corrupted_pages.push(page_id);
                    report.error(format!("page {}: {}", page_id, e));
                    continue;
                }
            };
            report.pages_checked += 1;

            if node.parent() != parent {
                report.error(format!(
                    "page {} points to parent {}, expected {}",
                    page_id,
                    node.parent(),
                    parent
                ));
            }
            if node.level() != level {
                report.error(format!(
                    "page {} is at level {}, expected {}",
                    page_id,
                    node.level(),
                    level
                ));
            }
            if node.len() > max {
                report.error(format!("page {} holds {} > {} entries", page_id, node.len(), max));
            }
            if page_id != header.root && node.len() < min {
                report.error(format!("page {} holds {} < {} entries", page_id, node.len(), min));
            }
            if let Some(expected) = expected {
                if expected.envelope != node.compute_envelope(dimension) {
                    report.error(format!(
                        "envelope of page {} in its parent is {}, actual {}",
                        page_id,
                        expected.envelope,
                        node.compute_envelope(dimension)
                    ));
                }
                if expected.largest_key != node.largest_key() {
                    report.error(format!("stale largest Hilbert key for page {}", page_id));
                }
            }

            match &node {
                Node::Leaf { entries, .. } => {
                    for e in entries {
                        report.entries_checked += 1;
                        if !seen_ids.insert(e.id) {
                            report.duplicate_ids.push(e.id);
                            report.error(format!("element {} is stored more than once", e.id));
                        }
                        if hilbert {
                            if last_key.is_some_and(|last| e.hilbert < last) {
                                report.error(format!(
                                    "element {} on page {} breaks Hilbert order",
                                    e.id, page_id
                                ));
                            }
                            last_key = Some(e.hilbert);
                        }
                        if let Some(mapper) = mapper {
                            match mapper.get_envelope(e.id) {
                                Ok(mapped) if mapped == e.envelope => {}
                                Ok(mapped) => report.error(format!(
                                    "element {} is stored as {} but mapped to {}",
                                    e.id, e.envelope, mapped
                                )),
                                Err(err) => report.error(format!(
                                    "element {} has no mapper record: {}",
                                    e.id, err
                                )),
                            }
                        }
                    }
                }
                Node::Internal { children, .. } => {
                    if children.is_empty() {
                        report.error(format!("internal page {} has no children", page_id));
                    }
                    for c in children.iter().rev() {
                        stack.push((c.page_id, page_id, level.saturating_sub(1), Some(c.clone())));
                    }
                }
            }
        }

        if report.entries_checked != header.element_count {
            report.error(format!(
                "header counts {} elements, leaves hold {}",
                header.element_count, report.entries_checked
            ));
        }
        if let Some(mapper) = mapper {
            if mapper.len() as u64 != header.element_count {
                report.error(format!(
                    "mapper holds {} elements, tree holds {}",
                    mapper.len(),
                    header.element_count
                ));
            }
        }

        let free: HashSet<PageId> = match self.store.free_pages() {
            Ok(pages) => pages.into_iter().collect(),
            Err(e) => {
                report.error(format!("free list unreadable: {}", e));
                HashSet::new()
            }
        };
        if free.len() as u64 != header.free_page_count {
            report.error(format!(
                "free list holds {} pages, header counts {}",
                free.len(),
                header.free_page_count
            ));
        }
        for page_id in (HEADER_PAGE + 1)..header.next_page_id {
            if !reachable.contains(&page_id) && !free.contains(&page_id) {
                report.orphaned_pages.push(page_id);
            }
        }
        if !report.orphaned_pages.is_empty() {
            report.error(format!("{} unreachable pages", report.orphaned_pages.len()));
        }

        Ok(report)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Writes dirty nodes and the header, then syncs the backend.
    pub fn flush(&mut self) -> SpatialResult<()> {
        self.cache.flush_all(&mut self.store)?;
        self.store.flush_header()?;
        self.store.sync()
    }

    pub fn close(&mut self) -> SpatialResult<()> {
        if self.store.is_closed() {
            return Ok(());
        }
        self.flush()?;
        self.cache.clear();
        self.store.close()
    }
}

fn least_enlargement(children: &[ChildRef], envelope: &Envelope) -> usize {
    let mut best = 0;
    let mut best_cost = (f64::INFINITY, f64::INFINITY);
    for (i, c) in children.iter().enumerate() {
        let cost = (c.envelope.enlargement(envelope), c.envelope.area());
        if cost < best_cost {
            best_cost = cost;
            best = i;
        }
    }
    best
}

fn least_overlap_enlargement(children: &[ChildRef], envelope: &Envelope) -> usize {
    let mut best = 0;
    let mut best_cost = (f64::INFINITY, f64::INFINITY, f64::INFINITY);
    for (i, c) in children.iter().enumerate() {
        let enlarged = c.envelope.union(envelope);
        let mut overlap_delta = 0.0;
        for (j, other) in children.iter().enumerate() {
            if i != j {
                overlap_delta +=
                    enlarged.overlap(&other.envelope) - c.envelope.overlap(&other.envelope);
            }
        }
        let cost = (
            overlap_delta,
            c.envelope.enlargement(envelope),
            c.envelope.area(),
        );
        if cost < best_cost {
            best_cost = cost;
            best = i;
        }
    }
    best
}
