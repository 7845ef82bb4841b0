//! Lazy, restartable intersection search.
//!
//! The cursor walks the tree depth first with an explicit stack of page ids,
//! loading each node through the engine's cache only when it is reached.

use std::collections::VecDeque;

use crate::envelope::Envelope;

use super::rtree_engine::TreeEngine;
use super::rtree_types::{ElementId, Node, PageId, SpatialResult};

/// Lazy intersection search over a tree.
///
/// Nodes are loaded as the cursor advances, so dropping it early costs
/// nothing beyond the pages already visited. Results come in no particular
/// order. An I/O or corruption error is yielded once and ends the scan;
/// [`SearchCursor::restart`] starts over from the root.
pub struct SearchCursor<'a> {
    engine: &'a mut TreeEngine,
    query: Envelope,
    stack: Vec<PageId>,
    ready: VecDeque<ElementId>,
}

impl<'a> SearchCursor<'a> {
    pub(crate) fn new(engine: &'a mut TreeEngine, query: Envelope) -> Self {
        let root = engine.root();
        SearchCursor {
            engine,
            query,
            stack: vec![root],
            ready: VecDeque::new(),
        }
    }

    pub fn query(&self) -> &Envelope {
        &self.query
    }

    /// Rewinds the cursor to the root.
    pub fn restart(&mut self) {
        self.ready.clear();
        self.stack.clear();
        self.stack.push(self.engine.root());
    }
}

impl Iterator for SearchCursor<'_> {
    type Item = SpatialResult<ElementId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.ready.pop_front() {
                return Some(Ok(id));
            }

            let page_id = self.stack.pop()?;
            match self.engine.load(page_id) {
                Ok(Node::Leaf { entries, .. }) => {
                    self.ready.extend(
                        entries
                            .iter()
                            .filter(|e| e.envelope.intersects(&self.query))
                            .map(|e| e.id),
                    );
                }
                Ok(Node::Internal { children, .. }) => {
                    self.stack.extend(
                        children
                            .iter()
                            .filter(|c| c.envelope.intersects(&self.query))
                            .map(|c| c.page_id),
                    );
                }
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}
