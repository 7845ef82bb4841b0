//! Constants for the paged R-Tree implementation.

use super::rtree_types::PageId;

/// Default page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted by the configuration
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size accepted by the configuration
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// Upper bound for the default fan-out, even when a page could hold more
pub const DEFAULT_MAX_ELEMENTS: usize = 64;

/// Smallest fan-out that still allows a meaningful split
pub const MIN_MAX_ELEMENTS: usize = 3;

/// Default minimum fill as a fraction of the maximum fan-out
pub const DEFAULT_MIN_FILL: f64 = 0.4;

/// Fraction of entries evicted by an R*-Tree forced reinsert
pub const DEFAULT_REINSERT_FRACTION: f64 = 0.3;

/// Default cache size in number of decoded nodes
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Highest supported number of dimensions
pub const MAX_DIMENSION: usize = 4;

/// Magic number of basic (linear / quadratic split) trees - "RTRB"
pub const MAGIC_BASIC: u32 = 0x5254_5242;

/// Magic number of R*-Trees - "RTRS"
pub const MAGIC_STAR: u32 = 0x5254_5253;

/// Magic number of Hilbert R-Trees - "RTRH"
pub const MAGIC_HILBERT: u32 = 0x5254_5248;

/// File format version
pub const VERSION: u32 = 1;

/// Every page ends with a CRC32 of the bytes before it
pub const CHECKSUM_SIZE: usize = 4;

/// Page holding the tree header
pub const HEADER_PAGE: PageId = 0;

/// Parent pointer of the root and terminator of the free list
pub const NO_PAGE: PageId = 0;

/// Memory-mapped files grow by this many pages at a time
pub const MMAP_GROWTH_PAGES: u64 = 64;

/// Longest accepted coordinate reference system identifier, in bytes
pub const MAX_CRS_IDENTIFIER_LEN: usize = 128;
