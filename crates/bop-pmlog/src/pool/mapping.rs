//! Segment mapping collaborators and the store-with-barrier primitive.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Weak};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::segment_file_path;
use crate::error::{LogMgrError, LogMgrResult};
use crate::fs::{create_fixed_size_file, ensure_dir, fsync_dir, open_existing};

const ANCHOR_FILE_NAME: &str = "log_pool.anchor";
const ANCHOR_FILE_SIZE: u64 = 8;

/// A read/write mapping of a persistent segment.
///
/// All mutation of pool bytes goes through raw pointers derived from the
/// mapping: 64-bit words via atomics, physical log bytes through exclusive
/// [`crate::SlotRegion`]s.
pub struct PoolMapping {
    base: u64,
    mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
    durable: bool,
}

// SAFETY: the raw pointer targets memory owned by `mmap`, which lives as long
// as the mapping. Shared words are only accessed atomically and slot regions
// hand out disjoint byte ranges.
unsafe impl Send for PoolMapping {}
unsafe impl Sync for PoolMapping {}

impl std::fmt::Debug for PoolMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMapping")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .field("durable", &self.durable)
            .finish()
    }
}

impl PoolMapping {
    /// Maps the whole of `file` shared and writable.
    pub fn from_file(base: u64, file: &File) -> LogMgrResult<Self> {
        // SAFETY: the segment file is owned by this process' pool and is not
        // truncated while mapped.
        let mmap = unsafe { MmapMut::map_mut(file).map_err(LogMgrError::from)? };
        Ok(Self::from_mmap(base, mmap, true))
    }

    /// Anonymous, zero-filled mapping. Survives only as long as it is referenced.
    pub fn anonymous(base: u64, len: usize) -> LogMgrResult<Self> {
        let mmap = MmapMut::map_anon(len).map_err(LogMgrError::from)?;
        Ok(Self::from_mmap(base, mmap, false))
    }

    fn from_mmap(base: u64, mut mmap: MmapMut, durable: bool) -> Self {
        let ptr = mmap.as_mut_ptr();
        let len = mmap.len();
        Self {
            base,
            mmap,
            ptr,
            len,
            durable,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when stores reach a backing file.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    fn check_word(&self, offset: usize) -> LogMgrResult<()> {
        let in_bounds = offset
            .checked_add(8)
            .is_some_and(|end| end <= self.len);
        if offset % 8 != 0 || !in_bounds {
            return Err(LogMgrError::mapping(format!(
                "word offset {offset} outside mapping of {} bytes",
                self.len
            )));
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `offset` must have passed [`Self::check_word`].
    unsafe fn word_unchecked(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: the mapping is page aligned, so a checked 8-aligned offset
        // is 8-aligned in memory and inside the mapping.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU64) }
    }

    fn word(&self, offset: usize) -> LogMgrResult<&AtomicU64> {
        self.check_word(offset)?;
        // SAFETY: checked above.
        Ok(unsafe { self.word_unchecked(offset) })
    }

    pub fn load_u64(&self, offset: usize) -> LogMgrResult<u64> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    /// Durably stores `value` at `offset` and fences before returning, so any
    /// write issued afterwards is ordered behind it.
    pub fn persist_u64(&self, offset: usize, value: u64) -> LogMgrResult<()> {
        self.word(offset)?.store(value, Ordering::Release);
        fence(Ordering::SeqCst);
        if self.durable {
            self.mmap
                .flush_range(offset, 8)
                .map_err(LogMgrError::from)?;
        }
        Ok(())
    }

    pub fn flush_range(&self, range: Range<usize>) -> LogMgrResult<()> {
        if range.start > range.end || range.end > self.len {
            return Err(LogMgrError::mapping(format!(
                "flush range {range:?} outside mapping of {} bytes",
                self.len
            )));
        }
        if self.durable && !range.is_empty() {
            self.mmap
                .flush_range(range.start, range.end - range.start)
                .map_err(LogMgrError::from)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> LogMgrResult<()> {
        if self.durable {
            self.mmap.flush().map_err(LogMgrError::from)?;
        }
        Ok(())
    }

    /// # Safety
    ///
    /// No mutable slice over an overlapping range may be live.
    pub(crate) unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start <= range.end && range.end <= self.len);
        // SAFETY: bounds checked; aliasing upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr.add(range.start), range.end - range.start) }
    }

    /// # Safety
    ///
    /// The caller must hold the only access to `range` for the slice lifetime.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        assert!(range.start <= range.end && range.end <= self.len);
        // SAFETY: bounds checked; exclusivity upheld by the caller.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.end - range.start)
        }
    }
}

/// A 64-bit word of a mapping whose offset was bounds-checked once.
#[derive(Debug, Clone)]
pub struct PoolWord {
    mapping: Arc<PoolMapping>,
    offset: usize,
}

impl PoolWord {
    pub fn new(mapping: Arc<PoolMapping>, offset: usize) -> LogMgrResult<Self> {
        mapping.check_word(offset)?;
        Ok(Self { mapping, offset })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn load(&self) -> u64 {
        // SAFETY: checked in `new`; a mapping never shrinks.
        unsafe { self.mapping.word_unchecked(self.offset) }.load(Ordering::Acquire)
    }

    pub fn persist(&self, value: u64) -> LogMgrResult<()> {
        self.mapping.persist_u64(self.offset, value)
    }
}

/// Supplies the persistent segment backing the log pool.
///
/// `anchor` is the persistent word recording the base of a fully created
/// pool; zero means no pool has been published yet.
pub trait SegmentMapper: Send + Sync {
    fn anchor(&self) -> LogMgrResult<u64>;

    /// Publishes `base` with a store-with-barrier.
    fn publish_anchor(&self, base: u64) -> LogMgrResult<()>;

    /// Returns the mapping of an existing segment at `base`, if any.
    fn find(&self, base: u64) -> LogMgrResult<Option<Arc<PoolMapping>>>;

    /// Creates and maps a zeroed segment of `size` bytes at `base`.
    fn create(&self, base: u64, size: u64) -> LogMgrResult<Arc<PoolMapping>>;

    /// Number of segment mappings this mapper has established.
    fn mappings_established(&self) -> usize;
}

/// File-backed segments under a root directory.
pub struct FileSegmentMapper {
    root: PathBuf,
    anchor: Mutex<Option<PoolWord>>,
    live: Mutex<HashMap<u64, Weak<PoolMapping>>>,
    established: AtomicUsize,
}

impl FileSegmentMapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            anchor: Mutex::new(None),
            live: Mutex::new(HashMap::new()),
            established: AtomicUsize::new(0),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    fn anchor_word(&self) -> LogMgrResult<PoolWord> {
        let mut guard = self.anchor.lock();
        if let Some(word) = guard.as_ref() {
            return Ok(word.clone());
        }
        ensure_dir(&self.root)?;
        let path = self.root.join(ANCHOR_FILE_NAME);
        let existing = match open_existing(&path)? {
            Some(file)
                if file.metadata().map_err(LogMgrError::from)?.len() >= ANCHOR_FILE_SIZE =>
            {
                Some(file)
            }
            Some(_) => {
                // A short anchor never held a published base.
                warn!(path = %path.display(), "recreating torn pool anchor");
                None
            }
            None => None,
        };
        let file = match existing {
            Some(file) => file,
            None => {
                let file = create_fixed_size_file(&path, ANCHOR_FILE_SIZE)?;
                fsync_dir(&self.root)?;
                file
            }
        };
        let word = PoolWord::new(Arc::new(PoolMapping::from_file(0, &file)?), 0)?;
        *guard = Some(word.clone());
        Ok(word)
    }

    fn track(&self, base: u64, mapping: PoolMapping) -> Arc<PoolMapping> {
        let mapping = Arc::new(mapping);
        self.live.lock().insert(base, Arc::downgrade(&mapping));
        self.established.fetch_add(1, Ordering::Relaxed);
        mapping
    }
}

impl SegmentMapper for FileSegmentMapper {
    fn anchor(&self) -> LogMgrResult<u64> {
        Ok(self.anchor_word()?.load())
    }

    fn publish_anchor(&self, base: u64) -> LogMgrResult<()> {
        self.anchor_word()?.persist(base)
    }

    fn find(&self, base: u64) -> LogMgrResult<Option<Arc<PoolMapping>>> {
        if let Some(mapping) = self.live.lock().get(&base).and_then(Weak::upgrade) {
            return Ok(Some(mapping));
        }
        let path = segment_file_path(&self.root, base);
        let Some(file) = open_existing(&path)? else {
            return Ok(None);
        };
        debug!(path = %path.display(), "mapping existing pool segment");
        let mapping = PoolMapping::from_file(base, &file)?;
        Ok(Some(self.track(base, mapping)))
    }

    fn create(&self, base: u64, size: u64) -> LogMgrResult<Arc<PoolMapping>> {
        ensure_dir(&self.root)?;
        let path = segment_file_path(&self.root, base);
        debug!(size, path = %path.display(), "creating pool segment");
        let file = create_fixed_size_file(&path, size)?;
        fsync_dir(&self.root)?;
        let mapping = PoolMapping::from_file(base, &file)?;
        Ok(self.track(base, mapping))
    }

    fn mappings_established(&self) -> usize {
        self.established.load(Ordering::Relaxed)
    }
}

/// Anonymous-memory segments kept alive by the mapper itself.
///
/// Dropping a manager and bringing up a new one over the same mapper
/// reincarnates the pool exactly as a restart over durable media would.
#[derive(Default)]
pub struct MemorySegmentMapper {
    anchor: AtomicU64,
    segments: Mutex<HashMap<u64, Arc<PoolMapping>>>,
    established: AtomicUsize,
}

impl MemorySegmentMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a segment while leaving the anchor untouched.
    pub fn forget_segment(&self, base: u64) -> Option<Arc<PoolMapping>> {
        self.segments.lock().remove(&base)
    }
}

impl SegmentMapper for MemorySegmentMapper {
    fn anchor(&self) -> LogMgrResult<u64> {
        Ok(self.anchor.load(Ordering::Acquire))
    }

    fn publish_anchor(&self, base: u64) -> LogMgrResult<()> {
        self.anchor.store(base, Ordering::Release);
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn find(&self, base: u64) -> LogMgrResult<Option<Arc<PoolMapping>>> {
        Ok(self.segments.lock().get(&base).cloned())
    }

    fn create(&self, base: u64, size: u64) -> LogMgrResult<Arc<PoolMapping>> {
        let len = usize::try_from(size)
            .map_err(|_| LogMgrError::mapping(format!("segment size {size} exceeds address space")))?;
        let mapping = Arc::new(PoolMapping::anonymous(base, len)?);
        self.segments.lock().insert(base, mapping.clone());
        self.established.fetch_add(1, Ordering::Relaxed);
        Ok(mapping)
    }

    fn mappings_established(&self) -> usize {
        self.established.load(Ordering::Relaxed)
    }
}
