//! Raw storage media for tree pages.
//!
//! A [`PageBackend`] is a flat, growable byte space. The page store on top of
//! it addresses page `n` at byte offset `n * page_size`. Four media are
//! available and selected through [`StorageLocation`]:
//! - fixed capacity memory,
//! - a random-access file,
//! - a memory-mapped file,
//! - a shared, growable byte buffer that outlives the tree.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use super::rtree_constants::{DEFAULT_PAGE_SIZE, MMAP_GROWTH_PAGES};
use super::rtree_types::{SpatialError, SpatialResult};

/// A byte-addressed storage medium.
pub trait PageBackend: Send {
    /// Logical length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `buf` from `offset`. Reading past the end is an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SpatialResult<()>;

    /// Writes `data` at `offset`, extending the medium when needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> SpatialResult<()>;

    /// Makes previous writes durable
    fn sync(&mut self) -> SpatialResult<()>;

    /// Releases the medium. Idempotent.
    fn close(&mut self) -> SpatialResult<()>;

    /// Short human readable description for logs
    fn describe(&self) -> String;
}

fn past_end(offset: u64, wanted: usize, len: u64) -> SpatialError {
    SpatialError::Storage(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "read of {} bytes at offset {} past end of storage ({} bytes)",
            wanted, offset, len
        ),
    ))
}

fn check_readable(offset: u64, wanted: usize, len: u64) -> SpatialResult<()> {
    match offset.checked_add(wanted as u64) {
        Some(end) if end <= len => Ok(()),
        _ => Err(past_end(offset, wanted, len)),
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Fixed-capacity in-memory storage, lost when dropped.
pub struct MemoryBackend {
    data: Vec<u8>,
    capacity: usize,
    closed: bool,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        MemoryBackend {
            data: Vec::new(),
            capacity,
            closed: false,
        }
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.closed {
            return Err(SpatialError::Closed);
        }
        Ok(())
    }
}

impl PageBackend for MemoryBackend {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SpatialResult<()> {
        self.check_open()?;
        check_readable(offset, buf.len(), self.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> SpatialResult<()> {
        self.check_open()?;
        let start = offset as usize;
        let end = start + data.len();
        if end > self.capacity {
            return Err(SpatialError::Storage(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "memory storage capacity of {} bytes exhausted",
                    self.capacity
                ),
            )));
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> SpatialResult<()> {
        self.check_open()
    }

    fn close(&mut self) -> SpatialResult<()> {
        self.closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory({} bytes)", self.capacity)
    }
}

// ============================================================================
// File
// ============================================================================

/// Random-access file: one seek and one read or write per access.
pub struct FileBackend {
    file: Option<File>,
    path: PathBuf,
    len: u64,
}

impl FileBackend {
    /// Create a new storage file, truncating any existing one
    pub fn create(path: &Path) -> SpatialResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(FileBackend {
            file: Some(file),
            path: path.to_path_buf(),
            len: 0,
        })
    }

    /// Open an existing storage file
    pub fn open(path: &Path) -> SpatialResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        Ok(FileBackend {
            file: Some(file),
            path: path.to_path_buf(),
            len,
        })
    }

    fn file(&mut self) -> SpatialResult<&mut File> {
        self.file.as_mut().ok_or(SpatialError::Closed)
    }
}

impl PageBackend for FileBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SpatialResult<()> {
        let len = self.len;
        let file = self.file()?;
        check_readable(offset, buf.len(), len)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> SpatialResult<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    fn sync(&mut self) -> SpatialResult<()> {
        self.file()?.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> SpatialResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file({})", self.path.display())
    }
}

// ============================================================================
// Memory-mapped file
// ============================================================================

/// Memory-mapped file. The file is grown in chunks and remapped; on close it
/// is trimmed back to its logical length.
pub struct MmapBackend {
    file: Option<File>,
    mmap: Option<MmapMut>,
    path: PathBuf,
    len: u64,
    mapped: u64,
}

impl MmapBackend {
    pub fn create(path: &Path) -> SpatialResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(MmapBackend {
            file: Some(file),
            mmap: None,
            path: path.to_path_buf(),
            len: 0,
            mapped: 0,
        })
    }

    pub fn open(path: &Path) -> SpatialResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        let mut backend = MmapBackend {
            file: Some(file),
            mmap: None,
            path: path.to_path_buf(),
            len,
            mapped: 0,
        };
        if len > 0 {
            backend.remap(len)?;
        }
        Ok(backend)
    }

    fn growth_chunk() -> u64 {
        MMAP_GROWTH_PAGES * DEFAULT_PAGE_SIZE as u64
    }

    /// Resizes the file to `size` bytes and maps all of it.
    fn remap(&mut self, size: u64) -> SpatialResult<()> {
        if let Some(old) = self.mmap.take() {
            old.flush()?;
        }
        let file = self.file.as_ref().ok_or(SpatialError::Closed)?;
        file.set_len(size)?;
        // SAFETY: this backend holds the only handle to the file and the old
        // mapping was dropped above. The file already has the mapped length
        // and is only resized here or in `close`, each time after the mapping
        // is gone. Other processes must not truncate a store while it is open.
        let mmap = unsafe { MmapOptions::new().len(size as usize).map_mut(file)? };
        self.mmap = Some(mmap);
        self.mapped = size;
        log::debug!("Remapped {} to {} bytes", self.path.display(), size);
        Ok(())
    }

    fn ensure_mapped(&mut self, end: u64) -> SpatialResult<()> {
        if end <= self.mapped {
            return Ok(());
        }
        let chunk = Self::growth_chunk();
        let target = end.max(self.mapped + chunk).div_ceil(chunk) * chunk;
        self.remap(target)
    }
}

impl PageBackend for MmapBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SpatialResult<()> {
        if self.file.is_none() {
            return Err(SpatialError::Closed);
        }
        check_readable(offset, buf.len(), self.len)?;
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| past_end(offset, buf.len(), 0))?;
        let start = offset as usize;
        buf.copy_from_slice(&mmap[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> SpatialResult<()> {
        if self.file.is_none() {
            return Err(SpatialError::Closed);
        }
        let end = offset + data.len() as u64;
        self.ensure_mapped(end)?;
        let mmap = self.mmap.as_mut().ok_or(SpatialError::Closed)?;
        let start = offset as usize;
        mmap[start..start + data.len()].copy_from_slice(data);
        self.len = self.len.max(end);
        Ok(())
    }

    fn sync(&mut self) -> SpatialResult<()> {
        if self.file.is_none() {
            return Err(SpatialError::Closed);
        }
        if let Some(mmap) = self.mmap.as_ref() {
            mmap.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> SpatialResult<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        if let Some(file) = self.file.take() {
            file.set_len(self.len)?;
            file.sync_all()?;
        }
        self.mapped = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mmap({})", self.path.display())
    }
}

// ============================================================================
// Shared buffer
// ============================================================================

/// Cloneable handle to a growable byte array. A tree created on a buffer can
/// be closed and reopened from another handle to the same bytes.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        SharedBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Replaces the contents, e.g. with bytes read from elsewhere
    pub fn replace(&self, bytes: Vec<u8>) {
        *self.bytes.write() = bytes;
    }

    /// Applies `f` to the raw bytes. Mostly useful to simulate damage in tests.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.bytes.write())
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBuffer({} bytes)", self.len())
    }
}

/// Storage over a [`SharedBuffer`].
pub struct BufferBackend {
    buffer: SharedBuffer,
    closed: bool,
}

impl BufferBackend {
    pub fn new(buffer: SharedBuffer) -> Self {
        BufferBackend {
            buffer,
            closed: false,
        }
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.closed {
            return Err(SpatialError::Closed);
        }
        Ok(())
    }
}

impl PageBackend for BufferBackend {
    fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SpatialResult<()> {
        self.check_open()?;
        let bytes = self.buffer.bytes.read();
        check_readable(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> SpatialResult<()> {
        self.check_open()?;
        let mut bytes = self.buffer.bytes.write();
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> SpatialResult<()> {
        self.check_open()
    }

    fn close(&mut self) -> SpatialResult<()> {
        self.closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("buffer({} bytes)", self.buffer.len())
    }
}

// ============================================================================
// Location
// ============================================================================

/// Where a tree keeps its pages. Chosen once, when the tree is created or
/// opened.
#[derive(Debug, Clone)]
pub enum StorageLocation {
    /// Volatile memory holding at most `capacity_pages` pages
    Memory { capacity_pages: usize },
    /// Random-access file
    File(PathBuf),
    /// Memory-mapped file
    MappedFile(PathBuf),
    /// Caller owned byte buffer
    Buffer(SharedBuffer),
}

impl StorageLocation {
    pub fn memory(capacity_pages: usize) -> Self {
        StorageLocation::Memory { capacity_pages }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        StorageLocation::File(path.as_ref().to_path_buf())
    }

    pub fn mapped_file(path: impl AsRef<Path>) -> Self {
        StorageLocation::MappedFile(path.as_ref().to_path_buf())
    }

    pub fn buffer(buffer: SharedBuffer) -> Self {
        StorageLocation::Buffer(buffer)
    }

    /// Creates a fresh, empty backend, discarding previous contents.
    pub fn create_backend(&self, page_size: usize) -> SpatialResult<Box<dyn PageBackend>> {
        let backend: Box<dyn PageBackend> = match self {
            StorageLocation::Memory { capacity_pages } => {
                Box::new(MemoryBackend::new(capacity_pages.saturating_mul(page_size)))
            }
            StorageLocation::File(path) => Box::new(FileBackend::create(path)?),
            StorageLocation::MappedFile(path) => Box::new(MmapBackend::create(path)?),
            StorageLocation::Buffer(buffer) => {
                buffer.replace(Vec::new());
                Box::new(BufferBackend::new(buffer.clone()))
            }
        };
        Ok(backend)
    }

    /// Opens an existing backend without altering its contents.
    pub fn open_backend(&self) -> SpatialResult<Box<dyn PageBackend>> {
        let backend: Box<dyn PageBackend> = match self {
            StorageLocation::Memory { .. } => {
                return Err(SpatialError::InvalidOperation(
                    "in-memory storage cannot be reopened".to_string(),
                ))
            }
            StorageLocation::File(path) => Box::new(FileBackend::open(path)?),
            StorageLocation::MappedFile(path) => Box::new(MmapBackend::open(path)?),
            StorageLocation::Buffer(buffer) => Box::new(BufferBackend::new(buffer.clone())),
        };
        Ok(backend)
    }
}
