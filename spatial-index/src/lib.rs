//! # Spatial Index - Paged R-Trees
//!
//! This crate provides multi-dimensional spatial indexes that keep their
//! nodes in fixed-size pages, loaded on demand through an LRU cache.
//!
//! ## Features
//!
//! - **Tree Variants**: R-Tree with linear or quadratic split, R*-Tree and
//!   Hilbert R-Tree
//! - **Pluggable Storage**: memory, random-access file, memory-mapped file or
//!   a shared byte buffer
//! - **Persistent**: checksummed pages survive process restarts
//! - **Element Mapping**: elements are removed or moved by id alone
//! - **Queries**: lazy intersection search, contained search and k-nearest
//!   neighbours
//! - **Up to 4 Dimensions**, tagged with a coordinate reference system
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spatial_index::{
//!     CrsDescriptor, Envelope, FileElementMapper, RTree, RTreeConfig, SplitPolicy,
//!     StorageLocation,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RTreeConfig::builder()
//!     .split_policy(SplitPolicy::RStar)
//!     .crs(CrsDescriptor::wgs84())
//!     .build()?;
//!
//! let location = StorageLocation::file("places.rtree");
//! let mapper = FileElementMapper::open("places.map", 2)?;
//! let mut tree = RTree::create(&location, config, Box::new(mapper))?;
//!
//! tree.insert(1, Envelope::rect(2.29, 48.85, 2.30, 48.86))?;
//! tree.insert(2, Envelope::rect(13.40, 52.51, 13.41, 52.52))?;
//! tree.close()?;
//!
//! // Later, possibly in another process
//! let mapper = FileElementMapper::open("places.map", 2)?;
//! let mut tree = RTree::open(&location, SplitPolicy::RStar, Box::new(mapper))?;
//! let in_paris = tree.search_ids(&Envelope::rect(2.2, 48.8, 2.4, 48.9))?;
//! assert_eq!(in_paris, vec![1]);
//! let nearest = tree.find_nearest(&[13.0, 52.0], 1, None)?;
//! assert_eq!(nearest[0].0, 2);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod crs;
pub mod envelope;
pub mod hilbert;
pub mod mapper;
pub mod rtree;
pub mod spatial_tree;

pub use crs::CrsDescriptor;
pub use envelope::Envelope;
pub use mapper::{ElementMapper, FileElementMapper, MemoryElementMapper};
pub use rtree::{
    ElementId, IntegrityReport, PageId, RTree, RTreeConfig, RTreeConfigBuilder, RTreeStats,
    SearchCursor, SharedBuffer, SpatialError, SpatialResult, SplitPolicy, StorageLocation,
};
pub use spatial_tree::{SharedRTree, SpatialTree};
