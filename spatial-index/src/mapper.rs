//! Element identity layer: maps caller ids to the envelopes they were
//! indexed with.
//!
//! The tree itself can only locate an entry by envelope. The mapper keeps
//! the authoritative envelope of every element so an element can be removed
//! or moved by id alone.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{envelope_width, PageReader, PageWriter};
use crate::envelope::Envelope;
use crate::rtree::rtree_constants::MAX_DIMENSION;
use crate::rtree::rtree_types::{ElementId, SpatialError, SpatialResult};

/// Storage of element id to envelope associations.
pub trait ElementMapper: Send {
    /// Envelope an element was indexed with, or `NotFound`.
    fn get_envelope(&self, id: ElementId) -> SpatialResult<Envelope>;

    /// Records the envelope of an element, replacing any previous one.
    fn set_envelope(&mut self, id: ElementId, envelope: &Envelope) -> SpatialResult<()>;

    /// Forgets an element. Returns its envelope if it was known.
    fn remove(&mut self, id: ElementId) -> SpatialResult<Option<Envelope>>;

    fn contains(&self, id: ElementId) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every known element id, in no particular order.
    fn ids(&self) -> Vec<ElementId>;

    fn clear(&mut self) -> SpatialResult<()>;

    fn flush(&mut self) -> SpatialResult<()>;

    fn close(&mut self) -> SpatialResult<()>;
}

// ============================================================================
// Memory
// ============================================================================

/// Mapper living only as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryElementMapper {
    envelopes: HashMap<ElementId, Envelope>,
}

impl MemoryElementMapper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ElementMapper for MemoryElementMapper {
    fn get_envelope(&self, id: ElementId) -> SpatialResult<Envelope> {
        self.envelopes
            .get(&id)
            .cloned()
            .ok_or(SpatialError::NotFound { id })
    }

    fn set_envelope(&mut self, id: ElementId, envelope: &Envelope) -> SpatialResult<()> {
        self.envelopes.insert(id, envelope.clone());
        Ok(())
    }

    fn remove(&mut self, id: ElementId) -> SpatialResult<Option<Envelope>> {
        Ok(self.envelopes.remove(&id))
    }

    fn contains(&self, id: ElementId) -> bool {
        self.envelopes.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.envelopes.len()
    }

    fn ids(&self) -> Vec<ElementId> {
        self.envelopes.keys().copied().collect()
    }

    fn clear(&mut self) -> SpatialResult<()> {
        self.envelopes.clear();
        Ok(())
    }

    fn flush(&mut self) -> SpatialResult<()> {
        Ok(())
    }

    fn close(&mut self) -> SpatialResult<()> {
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

const MAPPER_MAGIC: u32 = 0x52544D50;
const MAPPER_VERSION: u8 = 1;
/// magic u32, version u8, dimension u8
const MAPPER_HEADER_SIZE: usize = 6;

const TAG_TOMBSTONE: u8 = 0;
const TAG_PUT: u8 = 1;

const fn record_size(dimension: usize) -> usize {
    1 + 8 + envelope_width(dimension)
}

/// Mapper persisted as an append-only log of fixed-size records next to the
/// tree.
///
/// Each record is `[tag u8][id u64][envelope]`, tag 1 recording an envelope
/// and tag 0 a removal. The log is replayed on open, the last record for an
/// id winning. A partial record at the end, left by an interrupted write, is
/// cut off. When stale records outnumber live ones the log is rewritten on
/// close.
pub struct FileElementMapper {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    envelopes: HashMap<ElementId, Envelope>,
    dimension: usize,
    records: u64,
}

impl FileElementMapper {
    /// Opens the mapper file at `path`, creating it if missing.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> SpatialResult<Self> {
        if !(1..=MAX_DIMENSION).contains(&dimension) {
            return Err(SpatialError::InvalidConfig(format!(
                "mapper dimension must be between 1 and {}, got {}",
                MAX_DIMENSION, dimension
            )));
        }

        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut envelopes = HashMap::new();
        let mut records = 0;
        if bytes.is_empty() {
            file.write_all(&encode_mapper_header(dimension)?)?;
            file.sync_data()?;
        } else {
            let valid = replay(&bytes, dimension, &mut envelopes, &mut records)?;
            if valid < bytes.len() {
                log::warn!(
                    "Dropping {} bytes of a partial record at the end of {}",
                    bytes.len() - valid,
                    path.display()
                );
                file.set_len(valid as u64)?;
            }
        }
        file.seek(SeekFrom::End(0))?;

        log::debug!(
            "Opened element mapper {} with {} elements ({} records)",
            path.display(),
            envelopes.len(),
            records
        );
        Ok(FileElementMapper {
            path,
            writer: Some(BufWriter::new(file)),
            envelopes,
            dimension,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in the log, stale ones included.
    pub fn record_count(&self) -> u64 {
        self.records
    }

    fn writer(&mut self) -> SpatialResult<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or(SpatialError::Closed)
    }

    fn append(&mut self, tag: u8, id: ElementId, envelope: &Envelope) -> SpatialResult<()> {
        let record = encode_record(tag, id, envelope, self.dimension)?;
        self.writer()?.write_all(&record)?;
        self.records += 1;
        Ok(())
    }

    /// Rewrites the log with one record per live element.
    fn compact(&mut self) -> SpatialResult<()> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".compact");
        let tmp = PathBuf::from(tmp);

        let mut ids: Vec<ElementId> = self.envelopes.keys().copied().collect();
        ids.sort_unstable();

        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(&encode_mapper_header(self.dimension)?)?;
        for id in &ids {
            if let Some(envelope) = self.envelopes.get(id) {
                out.write_all(&encode_record(TAG_PUT, *id, envelope, self.dimension)?)?;
            }
        }
        out.flush()?;
        out.get_ref().sync_data()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;

        log::debug!(
            "Compacted element mapper {}: {} records down to {}",
            self.path.display(),
            self.records,
            ids.len()
        );
        self.records = ids.len() as u64;
        Ok(())
    }
}

fn encode_mapper_header(dimension: usize) -> SpatialResult<Vec<u8>> {
    let mut buf = vec![0u8; MAPPER_HEADER_SIZE];
    let mut writer = PageWriter::new(&mut buf);
    writer.put(MAPPER_MAGIC)?;
    writer.put(MAPPER_VERSION)?;
    writer.put(dimension as u8)?;
    Ok(buf)
}

fn encode_record(
    tag: u8,
    id: ElementId,
    envelope: &Envelope,
    dimension: usize,
) -> SpatialResult<Vec<u8>> {
    let mut buf = vec![0u8; record_size(dimension)];
    let mut writer = PageWriter::new(&mut buf);
    writer.put(tag)?;
    writer.put(id)?;
    writer.put_envelope(envelope)?;
    Ok(buf)
}

/// Applies every complete record of a mapper file. Returns the length of the
/// valid prefix.
fn replay(
    bytes: &[u8],
    dimension: usize,
    envelopes: &mut HashMap<ElementId, Envelope>,
    records: &mut u64,
) -> SpatialResult<usize> {
    if bytes.len() < MAPPER_HEADER_SIZE {
        return Err(SpatialError::MapperCorruption {
            offset: 0,
            reason: format!("header truncated to {} bytes", bytes.len()),
        });
    }
    let mut header = PageReader::new(bytes);
    let magic: u32 = header.get()?;
    if magic != MAPPER_MAGIC {
        return Err(SpatialError::FormatMismatch {
            field: "mapper magic",
            expected: format!("{:#010x}", MAPPER_MAGIC),
            actual: format!("{:#010x}", magic),
        });
    }
    let version: u8 = header.get()?;
    if version != MAPPER_VERSION {
        return Err(SpatialError::FormatMismatch {
            field: "mapper version",
            expected: MAPPER_VERSION.to_string(),
            actual: version.to_string(),
        });
    }
    let stored: u8 = header.get()?;
    if stored as usize != dimension {
        return Err(SpatialError::FormatMismatch {
            field: "mapper dimension",
            expected: dimension.to_string(),
            actual: stored.to_string(),
        });
    }

    let size = record_size(dimension);
    let mut offset = MAPPER_HEADER_SIZE;
    while offset + size <= bytes.len() {
        let mut reader = PageReader::new(&bytes[offset..offset + size]);
        let tag: u8 = reader.get()?;
        let id: ElementId = reader.get()?;
        match tag {
            TAG_PUT => {
                envelopes.insert(id, reader.get_envelope(dimension)?);
            }
            TAG_TOMBSTONE => {
                envelopes.remove(&id);
            }
            other => {
                return Err(SpatialError::MapperCorruption {
                    offset: offset as u64,
                    reason: format!("unknown record tag {}", other),
                })
            }
        }
        *records += 1;
        offset += size;
    }
    Ok(offset)
}

impl ElementMapper for FileElementMapper {
    fn get_envelope(&self, id: ElementId) -> SpatialResult<Envelope> {
        self.envelopes
            .get(&id)
            .cloned()
            .ok_or(SpatialError::NotFound { id })
    }

    fn set_envelope(&mut self, id: ElementId, envelope: &Envelope) -> SpatialResult<()> {
        if envelope.dimension() != self.dimension {
            return Err(SpatialError::InvalidOperation(format!(
                "envelope of dimension {} given to a {}D mapper",
                envelope.dimension(),
                self.dimension
            )));
        }
        self.append(TAG_PUT, id, envelope)?;
        self.envelopes.insert(id, envelope.clone());
        Ok(())
    }

    fn remove(&mut self, id: ElementId) -> SpatialResult<Option<Envelope>> {
        if !self.envelopes.contains_key(&id) {
            return Ok(None);
        }
        self.append(TAG_TOMBSTONE, id, &Envelope::empty(self.dimension))?;
        Ok(self.envelopes.remove(&id))
    }

    fn contains(&self, id: ElementId) -> bool {
        self.envelopes.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.envelopes.len()
    }

    fn ids(&self) -> Vec<ElementId> {
        self.envelopes.keys().copied().collect()
    }

    fn clear(&mut self) -> SpatialResult<()> {
        let writer = self.writer()?;
        writer.flush()?;
        let file = writer.get_mut();
        file.set_len(MAPPER_HEADER_SIZE as u64)?;
        file.seek(SeekFrom::End(0))?;
        self.envelopes.clear();
        self.records = 0;
        Ok(())
    }

    fn flush(&mut self) -> SpatialResult<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> SpatialResult<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        self.flush()?;
        self.writer = None;

        let live = self.envelopes.len() as u64;
        if self.records - live > live {
            self.compact()?;
        }
        self.envelopes.clear();
        log::debug!("Closed element mapper {}", self.path.display());
        Ok(())
    }
}

impl Drop for FileElementMapper {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush element mapper {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn rect(i: u64) -> Envelope {
        let x = i as f64;
        Envelope::rect(x, x, x + 1.0, x + 2.0)
    }

    fn exercise(mapper: &mut dyn ElementMapper) {
        assert!(mapper.is_empty());
        mapper.set_envelope(1, &rect(1)).unwrap();
        mapper.set_envelope(2, &rect(2)).unwrap();
        mapper.set_envelope(1, &rect(10)).unwrap();
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.get_envelope(1).unwrap(), rect(10));
        assert!(mapper.contains(2));

        assert_eq!(mapper.remove(2).unwrap(), Some(rect(2)));
        assert_eq!(mapper.remove(2).unwrap(), None);
        assert!(matches!(
            mapper.get_envelope(2),
            Err(SpatialError::NotFound { id: 2 })
        ));
        assert_eq!(mapper.ids(), vec![1]);

        mapper.clear().unwrap();
        assert!(mapper.is_empty());
    }

    #[test]
    fn test_memory_mapper() {
        let mut mapper = MemoryElementMapper::new();
        exercise(&mut mapper);
        mapper.flush().unwrap();
        mapper.close().unwrap();
    }

    #[test]
    fn test_file_mapper() {
        let dir = tempdir().unwrap();
        let mut mapper = FileElementMapper::open(dir.path().join("ids.map"), 2).unwrap();
        exercise(&mut mapper);
        mapper.close().unwrap();
        assert!(matches!(
            mapper.set_envelope(1, &rect(1)),
            Err(SpatialError::Closed)
        ));
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.map");

        let mut mapper = FileElementMapper::open(&path, 2).unwrap();
        for i in 0..10 {
            mapper.set_envelope(i, &rect(i)).unwrap();
        }
        mapper.remove(3).unwrap();
        mapper.set_envelope(4, &rect(40)).unwrap();
        mapper.close().unwrap();

        let mapper = FileElementMapper::open(&path, 2).unwrap();
        assert_eq!(mapper.len(), 9);
        assert!(!mapper.contains(3));
        assert_eq!(mapper.get_envelope(4).unwrap(), rect(40));
        assert_eq!(mapper.get_envelope(9).unwrap(), rect(9));
    }

    #[test]
    fn test_partial_tail_is_dropped() {
        init_logger();
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.map");

        let mut mapper = FileElementMapper::open(&path, 2).unwrap();
        mapper.set_envelope(1, &rect(1)).unwrap();
        mapper.set_envelope(2, &rect(2)).unwrap();
        mapper.close().unwrap();

        let full = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[TAG_PUT, 0, 0, 0, 0, 0]).unwrap();
        drop(file);

        let mapper = FileElementMapper::open(&path, 2).unwrap();
        assert_eq!(mapper.len(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), full);
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.map");

        let mut mapper = FileElementMapper::open(&path, 2).unwrap();
        mapper.set_envelope(1, &rect(1)).unwrap();
        mapper.close().unwrap();

        let mut bad = encode_record(TAG_PUT, 2, &rect(2), 2).unwrap();
        bad[0] = 7;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&bad).unwrap();
        drop(file);

        match FileElementMapper::open(&path, 2) {
            Err(SpatialError::MapperCorruption { offset, .. }) => {
                assert_eq!(offset, (MAPPER_HEADER_SIZE + record_size(2)) as u64)
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.len())),
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.map");
        FileElementMapper::open(&path, 2).unwrap().close().unwrap();

        assert!(matches!(
            FileElementMapper::open(&path, 3),
            Err(SpatialError::FormatMismatch { field: "mapper dimension", .. })
        ));
        assert!(matches!(
            FileElementMapper::open(dir.path().join("other.map"), 9),
            Err(SpatialError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_compaction_on_close() {
        init_logger();
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.map");

        let mut mapper = FileElementMapper::open(&path, 2).unwrap();
        for round in 0..5 {
            for i in 0..20 {
                mapper.set_envelope(i, &rect(i + round)).unwrap();
            }
        }
        assert_eq!(mapper.record_count(), 100);
        mapper.close().unwrap();
        assert_eq!(mapper.record_count(), 20);

        let expected = (MAPPER_HEADER_SIZE + 20 * record_size(2)) as u64;
        assert_eq!(fs::metadata(&path).unwrap().len(), expected);

        let mapper = FileElementMapper::open(&path, 2).unwrap();
        assert_eq!(mapper.len(), 20);
        assert_eq!(mapper.get_envelope(7).unwrap(), rect(11));
    }
}
