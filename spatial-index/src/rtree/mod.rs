//! Paged R-Tree implementation.
//!
//! This module provides an R-Tree designed for paged storage with:
//! - Fixed-size, checksummed pages on memory, file, mmap or buffer backends
//! - A write-back LRU node cache, so only hot nodes are held in memory
//! - Linear, quadratic, R* and Hilbert split and insertion policies
//! - Lazy search cursors, contained search and k-nearest-neighbour search

pub mod backend;
pub mod node_codec;
pub mod persistence;
pub mod rtree_cache;
pub mod rtree_config;
pub mod rtree_constants;
pub mod rtree_split;
pub mod rtree_storage;
pub mod rtree_types;

mod rtree_engine;
mod rtree_impl;
mod rtree_search;

pub use backend::{
    BufferBackend, FileBackend, MemoryBackend, MmapBackend, PageBackend, SharedBuffer,
    StorageLocation,
};
pub use persistence::{IntegrityReport, TreeHeader};
pub use rtree_config::{RTreeConfig, RTreeConfigBuilder};
pub use rtree_constants::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};
pub use rtree_impl::RTree;
pub use rtree_search::SearchCursor;
pub use rtree_split::{SplitPolicy, TreeFamily};
pub use rtree_types::{
    ChildRef, ElementId, LeafEntry, Node, PageId, RTreeStats, SpatialError, SpatialResult,
};
