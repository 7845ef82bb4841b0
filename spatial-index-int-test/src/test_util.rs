use rand::rngs::StdRng;
use rand::Rng;
use spatial_index::{
    CrsDescriptor, ElementMapper, Envelope, FileElementMapper, MemoryElementMapper, RTree,
    RTreeConfig, SharedBuffer, SpatialResult, SplitPolicy, StorageLocation,
};
use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::{env, fs, thread};

pub const ALL_POLICIES: [SplitPolicy; 4] = [
    SplitPolicy::Linear,
    SplitPolicy::Quadratic,
    SplitPolicy::RStar,
    SplitPolicy::Hilbert,
];

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread; the context is always handed to `after`.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> SpatialResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> SpatialResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> SpatialResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => after(ctx)
                        .map_err(|e| (format!("After run failed: {:?}", e), backtrace.to_string())),
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                last_error = Some(format!("Panic: {}", err_msg));
                last_backtrace = Some(Backtrace::capture().to_string());

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Panic: {}", err_msg);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
        }
    }

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// Storage medium a test context builds its trees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    File,
    MappedFile,
    Buffer,
}

impl BackendKind {
    pub const PERSISTENT: [BackendKind; 3] =
        [BackendKind::File, BackendKind::MappedFile, BackendKind::Buffer];
}

#[derive(Clone)]
pub struct TestContext {
    dir: PathBuf,
    kind: BackendKind,
    buffer: SharedBuffer,
}

impl TestContext {
    pub fn new(dir: PathBuf, kind: BackendKind) -> Self {
        Self {
            dir,
            kind,
            buffer: SharedBuffer::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn tree_path(&self) -> PathBuf {
        self.dir.join("tree.rtree")
    }

    pub fn mapper_path(&self) -> PathBuf {
        self.dir.join("tree.map")
    }

    pub fn location(&self) -> StorageLocation {
        match self.kind {
            BackendKind::Memory => StorageLocation::memory(1 << 16),
            BackendKind::File => StorageLocation::file(self.tree_path()),
            BackendKind::MappedFile => StorageLocation::mapped_file(self.tree_path()),
            BackendKind::Buffer => StorageLocation::buffer(self.buffer.clone()),
        }
    }

    /// File backed mapper for file storage, in-memory mapper otherwise.
    pub fn mapper(&self, dimension: usize) -> SpatialResult<Box<dyn ElementMapper>> {
        match self.kind {
            BackendKind::File | BackendKind::MappedFile => Ok(Box::new(FileElementMapper::open(
                self.mapper_path(),
                dimension,
            )?)),
            BackendKind::Memory | BackendKind::Buffer => Ok(Box::new(MemoryElementMapper::new())),
        }
    }

    pub fn create_tree(&self, config: RTreeConfig) -> SpatialResult<RTree> {
        let mapper = self.mapper(config.dimension())?;
        RTree::create(&self.location(), config, mapper)
    }

    pub fn open_tree(&self, split_policy: SplitPolicy, dimension: usize) -> SpatialResult<RTree> {
        RTree::open(&self.location(), split_policy, self.mapper(dimension)?)
    }
}

pub fn random_path() -> PathBuf {
    let id = uuid::Uuid::new_v4();
    env::temp_dir().join(format!("spatial-index-{}", id))
}

pub fn create_test_context(kind: BackendKind) -> SpatialResult<TestContext> {
    let dir = random_path();
    fs::create_dir_all(&dir)?;
    Ok(TestContext::new(dir, kind))
}

pub fn memory_context() -> SpatialResult<TestContext> {
    create_test_context(BackendKind::Memory)
}

pub fn file_context() -> SpatialResult<TestContext> {
    create_test_context(BackendKind::File)
}

pub fn cleanup(ctx: TestContext) -> SpatialResult<()> {
    let max_retries = 5;
    for retry in 0..max_retries {
        if !ctx.dir().exists() {
            return Ok(());
        }
        match fs::remove_dir_all(ctx.dir()) {
            Ok(_) => return Ok(()),
            Err(e) if retry < max_retries - 1 => {
                eprintln!(
                    "Warning: failed to remove {} (attempt {}): {}",
                    ctx.dir().display(),
                    retry + 1,
                    e
                );
                thread::sleep(Duration::from_millis(50 * (retry + 1) as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Configuration used by most tests: small nodes so trees grow deep quickly.
pub fn test_config(split_policy: SplitPolicy, max_elements: usize) -> SpatialResult<RTreeConfig> {
    RTreeConfig::builder()
        .split_policy(split_policy)
        .max_elements(max_elements)
        .page_size(1024)
        .cache_pages(64)
        .crs(CrsDescriptor::cartesian(2).with_domain(Envelope::rect(0.0, 0.0, 1000.0, 1000.0)))
        .build()
}

/// A small random box inside the 1000 x 1000 test domain.
pub fn random_envelope(rng: &mut StdRng) -> Envelope {
    let x = rng.random_range(0.0..990.0);
    let y = rng.random_range(0.0..990.0);
    let w = rng.random_range(0.0..10.0);
    let h = rng.random_range(0.0..10.0);
    Envelope::rect(x, y, x + w, y + h)
}

/// Ids of `elements` intersecting `query`, sorted.
pub fn brute_force_search(elements: &[(u64, Envelope)], query: &Envelope) -> Vec<u64> {
    let mut ids: Vec<u64> = elements
        .iter()
        .filter(|(_, e)| e.intersects(query))
        .map(|(id, _)| *id)
        .collect();
    ids.sort_unstable();
    ids
}

/// Panics with the report's errors unless the tree is fully consistent.
pub fn assert_integrity(tree: &mut RTree) -> SpatialResult<()> {
    let report = tree.check_integrity()?;
    assert!(report.is_valid, "integrity errors: {:?}", report.errors);
    Ok(())
}
