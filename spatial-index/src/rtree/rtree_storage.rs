//! Page store for the R-Tree.
//!
//! The store turns a raw [`PageBackend`] into a collection of fixed-size,
//! checksummed pages. Page 0 holds the [`TreeHeader`]; every other page holds
//! a node or a free-list link. Each read or write touches exactly one page;
//! there is no preloading.

use super::backend::PageBackend;
use super::node_codec::{decode_free_page, encode_free_page, page_tag, TAG_FREE};
use super::persistence::{TreeHeader, HEADER_PREFIX_SIZE};
use super::rtree_constants::{CHECKSUM_SIZE, HEADER_PAGE, NO_PAGE};
use super::rtree_types::{PageId, SpatialError, SpatialResult};

pub struct PageStore {
    backend: Box<dyn PageBackend>,
    header: TreeHeader,
    page_size: usize,
    closed: bool,
    reads: u64,
    writes: u64,
}

impl PageStore {
    /// Initialises an empty store and writes its header.
    pub fn create(backend: Box<dyn PageBackend>, header: TreeHeader) -> SpatialResult<Self> {
        let page_size = header.page_size as usize;
        let mut store = PageStore {
            backend,
            header,
            page_size,
            closed: false,
            reads: 0,
            writes: 0,
        };
        store.flush_header()?;
        log::debug!(
            "Created page store on {} with {} byte pages",
            store.backend.describe(),
            page_size
        );
        Ok(store)
    }

    /// Opens an existing store, validating its header.
    pub fn open(mut backend: Box<dyn PageBackend>) -> SpatialResult<Self> {
        let len = backend.len();
        let mut prefix = vec![0u8; HEADER_PREFIX_SIZE.min(len as usize)];
        backend.read_at(0, &mut prefix)?;
        let page_size = TreeHeader::peek(&prefix)?;

        if len < page_size as u64 {
            return Err(SpatialError::corruption(
                HEADER_PAGE,
                format!("store holds {} bytes, less than one {} byte page", len, page_size),
            ));
        }

        let mut raw = vec![0u8; page_size];
        backend.read_at(0, &mut raw)?;
        let usable = verify_checksum(HEADER_PAGE, &raw)?;
        let header = TreeHeader::decode(usable)?;

        let needed = header.next_page_id.saturating_mul(page_size as u64);
        if len < needed {
            return Err(SpatialError::corruption(
                HEADER_PAGE,
                format!("store truncated: {} bytes present, {} expected", len, needed),
            ));
        }

        log::debug!(
            "Opened page store on {} ({} pages)",
            backend.describe(),
            header.next_page_id
        );

        Ok(PageStore {
            backend,
            header,
            page_size,
            closed: false,
            reads: 0,
            writes: 0,
        })
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.closed {
            return Err(SpatialError::Closed);
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes available to page content, checksum excluded
    pub fn usable_size(&self) -> usize {
        self.page_size - CHECKSUM_SIZE
    }

    pub fn header(&self) -> &TreeHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut TreeHeader {
        &mut self.header
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }

    fn check_node_page(&self, page_id: PageId) -> SpatialResult<()> {
        if page_id == HEADER_PAGE || page_id >= self.header.next_page_id {
            return Err(SpatialError::OutOfRange { page_id });
        }
        Ok(())
    }

    fn read_raw(&mut self, page_id: PageId) -> SpatialResult<Vec<u8>> {
        let mut raw = vec![0u8; self.page_size];
        let offset = self.offset(page_id);
        self.backend.read_at(offset, &mut raw)?;
        self.reads += 1;
        let usable = verify_checksum(page_id, &raw)?.len();
        raw.truncate(usable);
        Ok(raw)
    }

    fn write_raw(&mut self, page_id: PageId, content: &[u8]) -> SpatialResult<()> {
        let mut raw = Vec::with_capacity(self.page_size);
        raw.extend_from_slice(content);
        raw.extend_from_slice(&crc32fast::hash(content).to_be_bytes());
        let offset = self.offset(page_id);
        self.backend.write_at(offset, &raw)?;
        self.writes += 1;
        Ok(())
    }

    /// Allocate a page from the free list or extend the store
    pub fn allocate_page(&mut self) -> SpatialResult<PageId> {
        self.check_open()?;

        if self.header.free_list_head != NO_PAGE {
            let page_id = self.header.free_list_head;
            let raw = self.read_raw(page_id)?;
            let next = decode_free_page(page_id, &raw)?;

            if next != NO_PAGE && (next == HEADER_PAGE || next >= self.header.next_page_id) {
                log::warn!(
                    "Free page {} links to invalid page {}, dropping the rest of the free list",
                    page_id,
                    next
                );
                self.header.free_list_head = NO_PAGE;
                self.header.free_page_count = 0;
            } else {
                self.header.free_list_head = next;
                self.header.free_page_count = self.header.free_page_count.saturating_sub(1);
                if next == NO_PAGE && self.header.free_page_count != 0 {
                    log::warn!(
                        "Free list exhausted with {} pages still counted",
                        self.header.free_page_count
                    );
                    self.header.free_page_count = 0;
                }
            }
            return Ok(page_id);
        }

        let page_id = self.header.next_page_id;
        // Reserve the page right away so that capacity errors surface here
        let blank = vec![0u8; self.usable_size()];
        self.write_raw(page_id, &blank)?;
        self.header.next_page_id = page_id.saturating_add(1);
        Ok(page_id)
    }

    /// Read a single page, returning its content without the checksum.
    pub fn read_page(&mut self, page_id: PageId) -> SpatialResult<Vec<u8>> {
        self.check_open()?;
        self.check_node_page(page_id)?;
        let raw = self.read_raw(page_id)?;
        if page_tag(&raw) == Some(TAG_FREE) {
            return Err(SpatialError::OutOfRange { page_id });
        }
        Ok(raw)
    }

    /// Write a single page; `content` must be exactly the usable page size.
    pub fn write_page(&mut self, page_id: PageId, content: &[u8]) -> SpatialResult<()> {
        self.check_open()?;
        if content.len() != self.usable_size() {
            return Err(SpatialError::MalformedData {
                offset: 0,
                needed: self.usable_size(),
                available: content.len(),
            });
        }
        self.check_node_page(page_id)?;
        self.write_raw(page_id, content)
    }

    /// Free a page by pushing it onto the free list
    pub fn free_page(&mut self, page_id: PageId) -> SpatialResult<()> {
        self.check_open()?;
        self.check_node_page(page_id)?;
        let link = encode_free_page(self.header.free_list_head, self.usable_size())?;
        self.write_raw(page_id, &link)?;
        self.header.free_list_head = page_id;
        self.header.free_page_count = self.header.free_page_count.saturating_add(1);
        Ok(())
    }

    /// Pages currently on the free list, in list order.
    pub fn free_pages(&mut self) -> SpatialResult<Vec<PageId>> {
        self.check_open()?;
        let mut pages = Vec::new();
        let mut current = self.header.free_list_head;
        while current != NO_PAGE {
            if pages.len() as u64 >= self.header.next_page_id {
                return Err(SpatialError::corruption(current, "free list contains a cycle"));
            }
            self.check_node_page(current)?;
            let raw = self.read_raw(current)?;
            pages.push(current);
            current = decode_free_page(current, &raw)?;
        }
        Ok(pages)
    }

    /// Persist the in-memory header to page 0
    pub fn flush_header(&mut self) -> SpatialResult<()> {
        self.check_open()?;
        let content = self.header.encode(self.usable_size())?;
        self.write_raw(HEADER_PAGE, &content)
    }

    /// Read the header currently stored on page 0
    pub fn read_header(&mut self) -> SpatialResult<TreeHeader> {
        self.check_open()?;
        let raw = self.read_raw(HEADER_PAGE)?;
        TreeHeader::decode(&raw)
    }

    pub fn sync(&mut self) -> SpatialResult<()> {
        self.check_open()?;
        self.backend.sync()
    }

    /// Release the backend. Idempotent.
    pub fn close(&mut self) -> SpatialResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.backend.close()?;
        log::debug!("Closed page store on {}", self.backend.describe());
        Ok(())
    }
}

/// Checks the CRC32 trailer of a raw page, returning the content part.
fn verify_checksum(page_id: PageId, raw: &[u8]) -> SpatialResult<&[u8]> {
    if raw.len() < CHECKSUM_SIZE {
        return Err(SpatialError::corruption(page_id, "page shorter than its checksum"));
    }
    let (content, trailer) = raw.split_at(raw.len() - CHECKSUM_SIZE);
    let mut stored = [0u8; CHECKSUM_SIZE];
    stored.copy_from_slice(trailer);
    let stored = u32::from_be_bytes(stored);
    let actual = crc32fast::hash(content);
    if stored != actual {
        return Err(SpatialError::corruption(
            page_id,
            format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, actual
            ),
        ));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::CrsDescriptor;
    use crate::rtree::backend::{MemoryBackend, SharedBuffer, StorageLocation};
    use crate::rtree::rtree_split::SplitPolicy;

    const PAGE: usize = 1024;

    fn header() -> TreeHeader {
        TreeHeader::new(PAGE, SplitPolicy::Quadratic, 8, 3, 30, CrsDescriptor::cartesian(2))
    }

    fn memory_store() -> PageStore {
        PageStore::create(Box::new(MemoryBackend::new(64 * PAGE)), header()).unwrap()
    }

    fn page_with(byte: u8, store: &PageStore) -> Vec<u8> {
        vec![byte; store.usable_size()]
    }

    #[test]
    fn test_allocate_extends_sequentially() {
        let mut store = memory_store();
        assert_eq!(store.allocate_page().unwrap(), 1);
        assert_eq!(store.allocate_page().unwrap(), 2);
        assert_eq!(store.header().next_page_id, 3);
    }

    #[test]
    fn test_write_read_page() {
        let mut store = memory_store();
        let id = store.allocate_page().unwrap();
        let content = page_with(7, &store);
        store.write_page(id, &content).unwrap();
        assert_eq!(store.read_page(id).unwrap(), content);
        assert_eq!(store.writes(), 3); // header, reservation, write
        assert_eq!(store.reads(), 1);
    }

    #[test]
    fn test_out_of_range() {
        let mut store = memory_store();
        assert!(matches!(
            store.read_page(0),
            Err(SpatialError::OutOfRange { page_id: 0 })
        ));
        assert!(matches!(
            store.read_page(5),
            Err(SpatialError::OutOfRange { page_id: 5 })
        ));
        let content = page_with(1, &store);
        assert!(matches!(
            store.write_page(5, &content),
            Err(SpatialError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_write_wrong_size_is_malformed() {
        let mut store = memory_store();
        let id = store.allocate_page().unwrap();
        assert!(matches!(
            store.write_page(id, &[0u8; 10]),
            Err(SpatialError::MalformedData { available: 10, .. })
        ));
    }

    #[test]
    fn test_free_list_reuse_is_lifo() {
        let mut store = memory_store();
        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        let c = store.allocate_page().unwrap();
        store.free_page(a).unwrap();
        store.free_page(c).unwrap();
        assert_eq!(store.header().free_page_count, 2);
        assert_eq!(store.free_pages().unwrap(), vec![c, a]);

        assert!(matches!(
            store.read_page(c),
            Err(SpatialError::OutOfRange { .. })
        ));

        assert_eq!(store.allocate_page().unwrap(), c);
        assert_eq!(store.allocate_page().unwrap(), a);
        assert_eq!(store.allocate_page().unwrap(), b + 2);
        assert_eq!(store.header().free_page_count, 0);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let buffer = SharedBuffer::new();
        let location = StorageLocation::buffer(buffer.clone());
        let backend = location.create_backend(PAGE).unwrap();
        let mut store = PageStore::create(backend, header()).unwrap();
        let id = store.allocate_page().unwrap();
        let content = page_with(9, &store);
        store.write_page(id, &content).unwrap();

        buffer.with_bytes_mut(|bytes| bytes[PAGE + 100] ^= 0xff);
        assert!(matches!(
            store.read_page(id),
            Err(SpatialError::Corruption { page_id: 1, .. })
        ));
    }

    #[test]
    fn test_reopen_restores_header() {
        let buffer = SharedBuffer::new();
        let location = StorageLocation::buffer(buffer.clone());
        let backend = location.create_backend(PAGE).unwrap();
        let mut store = PageStore::create(backend, header()).unwrap();
        let id = store.allocate_page().unwrap();
        store.header_mut().root = id;
        store.header_mut().element_count = 42;
        store.flush_header().unwrap();
        store.close().unwrap();

        let mut reopened = PageStore::open(location.open_backend().unwrap()).unwrap();
        assert_eq!(reopened.header().root, id);
        assert_eq!(reopened.header().element_count, 42);
        assert_eq!(reopened.read_header().unwrap(), *reopened.header());
    }

    #[test]
    fn test_open_rejects_foreign_bytes() {
        let buffer = SharedBuffer::new();
        buffer.replace(b"definitely not a tree".to_vec());
        let err = PageStore::open(StorageLocation::buffer(buffer).open_backend().unwrap());
        assert!(matches!(
            err,
            Err(SpatialError::FormatMismatch { field: "magic", .. })
        ));

        let empty = SharedBuffer::new();
        let err = PageStore::open(StorageLocation::buffer(empty).open_backend().unwrap());
        assert!(matches!(
            err,
            Err(SpatialError::FormatMismatch { field: "length", .. })
        ));
    }

    #[test]
    fn test_capacity_exhaustion_fails_allocation() {
        let mut store =
            PageStore::create(Box::new(MemoryBackend::new(3 * PAGE)), header()).unwrap();
        store.allocate_page().unwrap();
        store.allocate_page().unwrap();
        assert!(matches!(
            store.allocate_page(),
            Err(SpatialError::Storage(_))
        ));
        assert_eq!(store.header().next_page_id, 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut store = memory_store();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.allocate_page(), Err(SpatialError::Closed)));
        assert!(matches!(store.read_page(1), Err(SpatialError::Closed)));
        assert!(matches!(store.flush_header(), Err(SpatialError::Closed)));
    }
}
