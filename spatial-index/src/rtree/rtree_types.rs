//! Core types and data structures for the paged R-Tree.
//!
//! This module defines the fundamental types used throughout the tree:
//! - Error types and result types
//! - Node types (Leaf and Internal) and their entries
//! - Statistics structures

use std::io;
use thiserror::Error;

use crate::envelope::Envelope;

use super::rtree_constants::NO_PAGE;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in spatial indexing operations
#[derive(Debug, Error)]
pub enum SpatialError {
    /// Bad magic number, version or tree family when opening a store
    #[error("Format mismatch in {field}: expected {expected}, found {actual}")]
    FormatMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// Checksum or structural inconsistency found on a page
    #[error("Page {page_id} is corrupted: {reason}")]
    Corruption { page_id: PageId, reason: String },

    /// Damaged record in an element mapper side file
    #[error("Element mapper corrupted at offset {offset}: {reason}")]
    MapperCorruption { offset: u64, reason: String },

    /// Page id that is not allocated (or sits on the free list)
    #[error("Page {page_id} is not allocated")]
    OutOfRange { page_id: PageId },

    /// Element id unknown to the element mapper
    #[error("Element {id} not found")]
    NotFound { id: ElementId },

    /// Failure of the underlying storage medium
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// Operation attempted after close
    #[error("Tree is closed")]
    Closed,

    /// Codec read or write past the end of a buffer
    #[error("Malformed data at offset {offset}: needed {needed} bytes, {available} available")]
    MalformedData {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SpatialError {
    pub(crate) fn corruption(page_id: PageId, reason: impl Into<String>) -> Self {
        SpatialError::Corruption {
            page_id,
            reason: reason.into(),
        }
    }
}

/// Result type for spatial operations
pub type SpatialResult<T> = Result<T, SpatialError>;

/// Caller supplied identifier of an indexed element
pub type ElementId = u64;

/// Page ID - unique identifier for a node/page in the backing store
pub type PageId = u64;

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about R-Tree operations
#[derive(Debug, Clone, Default)]
pub struct RTreeStats {
    pub total_entries: u64,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub tree_height: u32,
    /// Node splits performed by this instance since it was opened
    pub splits: u64,
    /// Pages handed out so far, header page excluded
    pub allocated_pages: u64,
    pub free_pages: u64,
}

// ============================================================================
// Node Types
// ============================================================================

/// Behaviour shared by leaf entries and child references, used by the split
/// strategies.
pub trait SpatialEntry: Clone {
    fn envelope(&self) -> &Envelope;

    /// Hilbert ordering key (zero outside Hilbert trees)
    fn key(&self) -> u64;
}

/// An entry in a leaf node
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub envelope: Envelope,
    pub id: ElementId,
    /// Hilbert index of the envelope centre
    pub hilbert: u64,
}

impl SpatialEntry for LeafEntry {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn key(&self) -> u64 {
        self.hilbert
    }
}

/// A child reference in an internal node
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRef {
    pub envelope: Envelope,
    pub page_id: PageId,
    /// Largest Hilbert key found in the child's subtree
    pub largest_key: u64,
}

impl SpatialEntry for ChildRef {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn key(&self) -> u64 {
        self.largest_key
    }
}

/// Node types in the R-Tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Leaf node containing element entries
    Leaf {
        parent: PageId,
        entries: Vec<LeafEntry>,
    },
    /// Internal node containing child references
    Internal {
        parent: PageId,
        level: u16, // Height from leaf level (leaves are 0)
        children: Vec<ChildRef>,
    },
}

impl Node {
    pub fn empty_leaf(parent: PageId) -> Self {
        Node::Leaf {
            parent,
            entries: Vec::new(),
        }
    }

    /// Get the envelope enclosing all children/entries
    pub fn compute_envelope(&self, dimension: usize) -> Envelope {
        let mut envelope = Envelope::empty(dimension);
        match self {
            Node::Leaf { entries, .. } => {
                for e in entries {
                    envelope.expand(&e.envelope);
                }
            }
            Node::Internal { children, .. } => {
                for c in children {
                    envelope.expand(&c.envelope);
                }
            }
        }
        envelope
    }

    /// Largest Hilbert key held by this node
    pub fn largest_key(&self) -> u64 {
        match self {
            Node::Leaf { entries, .. } => entries.iter().map(|e| e.hilbert).max(),
            Node::Internal { children, .. } => children.iter().map(|c| c.largest_key).max(),
        }
        .unwrap_or(0)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn level(&self) -> u16 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { level, .. } => *level,
        }
    }

    pub fn parent(&self) -> PageId {
        match self {
            Node::Leaf { parent, .. } | Node::Internal { parent, .. } => *parent,
        }
    }

    pub fn set_parent(&mut self, page_id: PageId) {
        match self {
            Node::Leaf { parent, .. } | Node::Internal { parent, .. } => *parent = page_id,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent() == NO_PAGE
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the reference to `page_id` among this node's children
    pub fn child_index(&self, page_id: PageId) -> Option<usize> {
        match self {
            Node::Leaf { .. } => None,
            Node::Internal { children, .. } => children.iter().position(|c| c.page_id == page_id),
        }
    }
}
