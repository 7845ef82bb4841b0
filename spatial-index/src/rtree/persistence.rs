//! Persistence features for R-Tree storage.
//!
//! This module provides:
//! - The tree header record kept on page 0
//! - Integrity reports produced by tree verification

use crate::codec::{PageReader, PageWriter};
use crate::crs::CrsDescriptor;

use super::rtree_constants::{
    HEADER_PAGE, MAGIC_BASIC, MAGIC_HILBERT, MAGIC_STAR, MAX_PAGE_SIZE, MIN_PAGE_SIZE, NO_PAGE,
    VERSION,
};
use super::rtree_split::{SplitPolicy, TreeFamily};
use super::rtree_types::{ElementId, PageId, SpatialError, SpatialResult};

/// Bytes needed to identify a store: magic, version and page size
pub const HEADER_PREFIX_SIZE: usize = 12;

// ============================================================================
// Tree Header
// ============================================================================

/// Tree metadata stored on page 0.
///
/// Layout (big-endian):
/// ```text
/// magic u32 | version u32 | page_size u32 | dimension u8 | split_policy u8
/// max_elements u16 | min_elements u16 | reinsert_percent u8 | root u64
/// height u16 | next_page_id u64 | free_list_head u64 | free_page_count u64
/// element_count u64 | crs_len u16 | crs bytes
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TreeHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub dimension: u8,
    pub split_policy: SplitPolicy,
    pub max_elements: u16,
    pub min_elements: u16,
    /// R* forced reinsert share, in percent of `max_elements`
    pub reinsert_percent: u8,
    pub root: PageId,
    pub height: u16,
    pub next_page_id: PageId,
    pub free_list_head: PageId,
    pub free_page_count: u64,
    pub element_count: u64,
    pub crs: CrsDescriptor,
}

impl TreeHeader {
    pub fn new(
        page_size: usize,
        split_policy: SplitPolicy,
        max_elements: usize,
        min_elements: usize,
        reinsert_percent: u8,
        crs: CrsDescriptor,
    ) -> Self {
        TreeHeader {
            magic: split_policy.family().magic(),
            version: VERSION,
            page_size: page_size as u32,
            dimension: crs.dimension,
            split_policy,
            max_elements: max_elements as u16,
            min_elements: min_elements as u16,
            reinsert_percent,
            root: NO_PAGE,
            height: 0,
            next_page_id: HEADER_PAGE + 1,
            free_list_head: NO_PAGE,
            free_page_count: 0,
            element_count: 0,
            crs,
        }
    }

    pub fn family(&self) -> TreeFamily {
        self.split_policy.family()
    }

    pub fn dimension(&self) -> usize {
        self.dimension as usize
    }

    /// Pages handed out so far, header excluded
    pub fn allocated_pages(&self) -> u64 {
        self.next_page_id.saturating_sub(HEADER_PAGE + 1)
    }

    pub fn encode(&self, usable_size: usize) -> SpatialResult<Vec<u8>> {
        let crs = self.crs.to_bytes()?;
        let crs_len = u16::try_from(crs.len()).map_err(|_| {
            SpatialError::InvalidConfig(format!("CRS record too large: {} bytes", crs.len()))
        })?;

        let mut buf = vec![0u8; usable_size];
        let mut w = PageWriter::new(&mut buf);
        w.put(self.magic)?;
        w.put(self.version)?;
        w.put(self.page_size)?;
        w.put(self.dimension)?;
        w.put(self.split_policy.as_u8())?;
        w.put(self.max_elements)?;
        w.put(self.min_elements)?;
        w.put(self.reinsert_percent)?;
        w.put(self.root)?;
        w.put(self.height)?;
        w.put(self.next_page_id)?;
        w.put(self.free_list_head)?;
        w.put(self.free_page_count)?;
        w.put(self.element_count)?;
        w.put(crs_len)?;
        w.put_bytes(&crs)?;
        Ok(buf)
    }

    /// Checks magic, version and page size from the first bytes of a store.
    /// Returns the page size.
    pub fn peek(buf: &[u8]) -> SpatialResult<usize> {
        if buf.len() < HEADER_PREFIX_SIZE {
            return Err(SpatialError::FormatMismatch {
                field: "length",
                expected: format!("at least {} bytes", HEADER_PREFIX_SIZE),
                actual: format!("{} bytes", buf.len()),
            });
        }
        let mut r = PageReader::new(buf);
        let magic: u32 = r.get()?;
        let version: u32 = r.get()?;
        let page_size: u32 = r.get()?;

        if TreeFamily::from_magic(magic).is_none() {
            return Err(SpatialError::FormatMismatch {
                field: "magic",
                expected: format!(
                    "one of {:#010x}, {:#010x}, {:#010x}",
                    MAGIC_BASIC, MAGIC_STAR, MAGIC_HILBERT
                ),
                actual: format!("{:#010x}", magic),
            });
        }
        if version != VERSION {
            return Err(SpatialError::FormatMismatch {
                field: "version",
                expected: VERSION.to_string(),
                actual: version.to_string(),
            });
        }
        let page_size = page_size as usize;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(SpatialError::FormatMismatch {
                field: "page_size",
                expected: format!("{}..={}", MIN_PAGE_SIZE, MAX_PAGE_SIZE),
                actual: page_size.to_string(),
            });
        }
        Ok(page_size)
    }

    pub fn decode(buf: &[u8]) -> SpatialResult<Self> {
        Self::peek(buf)?;

        let mut r = PageReader::new(buf);
        let magic: u32 = r.get()?;
        let version: u32 = r.get()?;
        let page_size: u32 = r.get()?;
        let dimension: u8 = r.get()?;
        let policy: u8 = r.get()?;
        let split_policy = SplitPolicy::from_u8(policy).ok_or_else(|| {
            SpatialError::corruption(HEADER_PAGE, format!("unknown split policy {}", policy))
        })?;
        if split_policy.family().magic() != magic {
            return Err(SpatialError::corruption(
                HEADER_PAGE,
                format!(
                    "split policy {:?} does not belong to magic {:#010x}",
                    split_policy, magic
                ),
            ));
        }

        let max_elements = r.get()?;
        let min_elements = r.get()?;
        let reinsert_percent = r.get()?;
        let root = r.get()?;
        let height = r.get()?;
        let next_page_id = r.get()?;
        let free_list_head = r.get()?;
        let free_page_count = r.get()?;
        let element_count = r.get()?;
        let crs_len: u16 = r.get()?;
        let crs = CrsDescriptor::from_bytes(r.get_bytes(crs_len as usize)?)?;

        if crs.dimension != dimension {
            return Err(SpatialError::corruption(
                HEADER_PAGE,
                format!(
                    "header dimension {} disagrees with CRS dimension {}",
                    dimension, crs.dimension
                ),
            ));
        }

        Ok(TreeHeader {
            magic,
            version,
            page_size,
            dimension,
            split_policy,
            max_elements,
            min_elements,
            reinsert_percent,
            root,
            height,
            next_page_id,
            free_list_head,
            free_page_count,
            element_count,
            crs,
        })
    }
}

// ============================================================================
// Integrity Checking
// ============================================================================

/// Result of integrity check operation
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    /// Total pages checked
    pub pages_checked: u64,
    /// Leaf entries visited
    pub entries_checked: u64,
    /// Pages that could not be read or decoded
    pub corrupted_pages: Vec<PageId>,
    /// Allocated pages neither reachable from the root nor on the free list
    pub orphaned_pages: Vec<PageId>,
    /// Element ids found more than once in the leaves
    pub duplicate_ids: Vec<ElementId>,
    /// Summary of findings
    pub is_valid: bool,
    /// Detailed error messages
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            pages_checked: 0,
            entries_checked: 0,
            corrupted_pages: Vec::new(),
            orphaned_pages: Vec::new(),
            duplicate_ids: Vec::new(),
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub(crate) fn error(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}
