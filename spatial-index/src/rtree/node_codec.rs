//! Binary layout of node and free-list pages.
//!
//! ```text
//! node page : [tag u8][level u16][parent u64][count u16] count * entry
//! entry     : [envelope 2*N f64][ref u64][key u64]
//! free page : [tag u8 = 3][next free u64]
//! ```
//!
//! `ref` is the element id in leaves and the child page id in internal nodes.
//! The CRC32 trailer is handled by the page store, not here.

use crate::codec::{envelope_width, PageReader, PageWriter};

use super::rtree_types::{ChildRef, LeafEntry, Node, PageId, SpatialError, SpatialResult};

pub const TAG_LEAF: u8 = 1;
pub const TAG_INTERNAL: u8 = 2;
pub const TAG_FREE: u8 = 3;

/// Size of the fixed node header
pub const NODE_HEADER_SIZE: usize = 1 + 2 + 8 + 2;

/// Encoded size of one entry in a tree of the given dimension
pub const fn entry_size(dimension: usize) -> usize {
    envelope_width(dimension) + 8 + 8
}

/// Most entries a node page of `usable_size` bytes can hold
pub fn max_entries_per_page(usable_size: usize, dimension: usize) -> usize {
    usable_size.saturating_sub(NODE_HEADER_SIZE) / entry_size(dimension)
}

/// Serializes a node into a zero-padded buffer of `usable_size` bytes.
pub fn encode_node(node: &Node, usable_size: usize) -> SpatialResult<Vec<u8>> {
    let mut buf = vec![0u8; usable_size];
    let mut w = PageWriter::new(&mut buf);

    match node {
        Node::Leaf { parent, entries } => {
            w.put(TAG_LEAF)?;
            w.put(0u16)?;
            w.put(*parent)?;
            w.put(entry_count(entries.len())?)?;
            for e in entries {
                w.put_envelope(&e.envelope)?;
                w.put(e.id)?;
                w.put(e.hilbert)?;
            }
        }
        Node::Internal {
            parent,
            level,
            children,
        } => {
            w.put(TAG_INTERNAL)?;
            w.put(*level)?;
            w.put(*parent)?;
            w.put(entry_count(children.len())?)?;
            for c in children {
                w.put_envelope(&c.envelope)?;
                w.put(c.page_id)?;
                w.put(c.largest_key)?;
            }
        }
    }

    Ok(buf)
}

fn entry_count(len: usize) -> SpatialResult<u16> {
    u16::try_from(len)
        .map_err(|_| {
            SpatialError::InvalidOperation(format!("node holds too many entries: {}", len))
        })
}

/// Decodes the node stored on `page_id`.
pub fn decode_node(page_id: PageId, buf: &[u8], dimension: usize) -> SpatialResult<Node> {
    let mut r = PageReader::new(buf);
    let tag: u8 = r.get()?;
    let level: u16 = r.get()?;
    let parent: PageId = r.get()?;
    let count: u16 = r.get()?;

    let capacity = max_entries_per_page(buf.len(), dimension);
    if count as usize > capacity {
        return Err(SpatialError::corruption(
            page_id,
            format!("entry count {} exceeds page capacity {}", count, capacity),
        ));
    }

    match tag {
        TAG_LEAF => {
            if level != 0 {
                return Err(SpatialError::corruption(
                    page_id,
                    format!("leaf page claims level {}", level),
                ));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let envelope = r.get_envelope(dimension)?;
                let id = r.get()?;
                let hilbert = r.get()?;
                entries.push(LeafEntry {
                    envelope,
                    id,
                    hilbert,
                });
            }
            Ok(Node::Leaf { parent, entries })
        }
        TAG_INTERNAL => {
            if level == 0 {
                return Err(SpatialError::corruption(page_id, "internal page at level 0"));
            }
            let mut children = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let envelope = r.get_envelope(dimension)?;
                let child: PageId = r.get()?;
                let largest_key = r.get()?;
                children.push(ChildRef {
                    envelope,
                    page_id: child,
                    largest_key,
                });
            }
            Ok(Node::Internal {
                parent,
                level,
                children,
            })
        }
        TAG_FREE => Err(SpatialError::OutOfRange { page_id }),
        other => Err(SpatialError::corruption(
            page_id,
            format!("unknown page tag {}", other),
        )),
    }
}

/// Serializes a free-list link page.
pub fn encode_free_page(next: PageId, usable_size: usize) -> SpatialResult<Vec<u8>> {
    let mut buf = vec![0u8; usable_size];
    let mut w = PageWriter::new(&mut buf);
    w.put(TAG_FREE)?;
    w.put(next)?;
    Ok(buf)
}

/// Reads the successor from a free-list link page.
pub fn decode_free_page(page_id: PageId, buf: &[u8]) -> SpatialResult<PageId> {
    let mut r = PageReader::new(buf);
    let tag: u8 = r.get()?;
    if tag != TAG_FREE {
        return Err(SpatialError::corruption(
            page_id,
            format!("free list points at a page tagged {}", tag),
        ));
    }
    r.get()
}

/// Page tag without decoding the rest of the page
pub fn page_tag(buf: &[u8]) -> Option<u8> {
    buf.first().copied()
}
