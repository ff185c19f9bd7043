//! # Chunked Mapped-File Manager
//!
//! This module implements [`MappedFile`], the owner of one sparse backing
//! file presented as an on-demand set of fixed-size mapped regions. Each
//! region ("chunk") is extended by a trailing overlap window so records that
//! straddle a chunk boundary stay contiguous in memory:
//!
//! ```text
//! file:    |----- chunk 0 -----|----- chunk 1 -----|----- chunk 2 -----|
//! map 0:   |----- chunk 0 -----|-ovl-|
//! map 1:                       |----- chunk 1 -----|-ovl-|
//! map 2:                                           |----- chunk 2 -----|-ovl-|
//! ```
//!
//! The file itself carries no header or metadata; byte `p` of the logical
//! stream is byte `p` of the file, so any external tool can read it.
//!
//! ## Acquire Path
//!
//! `acquire_byte_store(position)` maps a position to chunk
//! `position / chunk_size` and, under the table lock:
//!
//! 1. hands out the cached [`ChunkStore`] if one is live (`try_reserve`),
//! 2. otherwise grows the file to `(chunk + 1) * chunk_size + overlap_size`
//!    if it is smaller, maps the region, installs the new store in the
//!    table, and notifies the [`NewChunkListener`].
//!
//! ## Cross-Process Growth
//!
//! Peer processes may share the file. Growth is serialized by a whole-file
//! exclusive advisory lock with a double-checked size read: read size, and
//! only if it is short take the lock, re-read, and resize if still short.
//! A process that observes a sufficient size never touches the lock.
//!
//! ## Lifecycle
//!
//! The manager is reference-counted like its stores. Each cached store is
//! kept alive by the manager's own reservation plus any outstanding consumer
//! reservations; chunks are sticky and are only unmapped when the manager
//! itself winds down. `close()` flips an atomic flag (idempotent), drains
//! every cached store on behalf of absent consumers, and drops the
//! manager's reservation; when the manager's count reaches zero the file
//! handle is closed. Errors on the shutdown path are logged at debug level
//! and swallowed; shutdown never propagates an error past `close()`.
//!
//! ## Thread Safety
//!
//! `MappedFile` is `Send + Sync`. The chunk table is guarded by a
//! `parking_lot::Mutex`; store reference counts are atomic; file growth is
//! additionally serialized across processes by the advisory lock.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{MapError, MapResult};
use crate::os;
use crate::refcount::ReferenceCounter;
use crate::store::{ChunkParams, ChunkRef, ChunkStore};

/// Default logical capacity: 2^40 bytes (1 TiB).
pub const DEFAULT_CAPACITY: u64 = 1 << 40;

/// Observability hook invoked once per materialized chunk.
///
/// Implementations must not panic. The callback fires inside the acquire
/// path after the new store is cached and the caller's reservation is
/// taken but before that reservation is wrapped in a [`ChunkRef`]; an
/// unwind here leaks the reservation, pinning the chunk's mapping until
/// [`MappedFile::close`] force-drains it. Catch and log instead.
pub trait NewChunkListener: Send + Sync {
    /// `elapsed_micros` measures the growth-map-install sequence for this
    /// chunk, from cache miss to installed store.
    fn on_new_chunk(&self, path: &Path, chunk: u64, elapsed_micros: u64);
}

/// Default listener: reports each allocation at debug level.
struct LogNewChunkListener;

impl NewChunkListener for LogNewChunkListener {
    fn on_new_chunk(&self, path: &Path, chunk: u64, elapsed_micros: u64) {
        tracing::debug!(
            path = %path.display(),
            chunk,
            elapsed_ms = elapsed_micros as f64 / 1e3,
            "allocated chunk"
        );
    }
}

/// A chunked, overlapping memory-mapped file.
///
/// See the [module docs](self) for the full lifecycle. Obtained via
/// [`MappedFile::open`] and shared as `Arc<MappedFile>`; the `Arc` governs
/// the allocation while the manager's own reservation count governs when
/// the chunk cache is torn down and the file handle closed.
pub struct MappedFile {
    path: PathBuf,
    file: Mutex<Option<Arc<File>>>,
    chunk_size: u64,
    overlap_size: u64,
    capacity: u64,
    chunks: Mutex<Vec<Option<Arc<ChunkStore>>>>,
    refs: ReferenceCounter,
    closed: AtomicBool,
    listener: RwLock<Arc<dyn NewChunkListener>>,
}

impl MappedFile {
    /// Opens (creating if absent) `path` with the given chunk size and an
    /// overlap of one OS page.
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: u64) -> MapResult<Arc<Self>> {
        Self::open_with_overlap(path, chunk_size, os::page_size())
    }

    /// Opens (creating if absent) `path` with explicit chunk and overlap
    /// sizes. Both are rounded up to a multiple of the OS page size; the
    /// effective values are observable via [`chunk_size`](Self::chunk_size)
    /// and [`overlap_size`](Self::overlap_size).
    pub fn open_with_overlap<P: AsRef<Path>>(
        path: P,
        chunk_size: u64,
        overlap_size: u64,
    ) -> MapResult<Arc<Self>> {
        Self::open_with_capacity(path, chunk_size, overlap_size, DEFAULT_CAPACITY)
    }

    /// Opens with an explicit logical capacity instead of
    /// [`DEFAULT_CAPACITY`]. The capacity is advisory: callers enforce it,
    /// the manager does not.
    pub fn open_with_capacity<P: AsRef<Path>>(
        path: P,
        chunk_size: u64,
        overlap_size: u64,
        capacity: u64,
    ) -> MapResult<Arc<Self>> {
        if chunk_size == 0 {
            return Err(MapError::invalid_argument("chunk size must be positive"));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self::from_parts(
            path,
            Arc::new(file),
            chunk_size,
            overlap_size,
            capacity,
        ))
    }

    fn from_parts(
        path: PathBuf,
        file: Arc<File>,
        chunk_size: u64,
        overlap_size: u64,
        capacity: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            file: Mutex::new(Some(file)),
            chunk_size: os::map_align(chunk_size),
            overlap_size: os::map_align(overlap_size),
            capacity,
            chunks: Mutex::new(Vec::new()),
            refs: ReferenceCounter::new(),
            closed: AtomicBool::new(false),
            listener: RwLock::new(Arc::new(LogNewChunkListener)),
        })
    }

    /// Returns a manager for the same file with different chunk/overlap
    /// sizes, or `self` unchanged when the sizes already match after page
    /// alignment.
    ///
    /// When the sizes differ the new manager shares the underlying file
    /// handle but has its own chunk table, and the caller's reservation on
    /// `self` is released. The two managers' stores must not be mixed; their
    /// mappings have different extents.
    pub fn with_sizes(self: &Arc<Self>, chunk_size: u64, overlap_size: u64) -> MapResult<Arc<Self>> {
        if chunk_size == 0 {
            return Err(MapError::invalid_argument("chunk size must be positive"));
        }
        let chunk_size = os::map_align(chunk_size);
        let overlap_size = os::map_align(overlap_size);
        if chunk_size == self.chunk_size && overlap_size == self.overlap_size {
            return Ok(Arc::clone(self));
        }
        let file = self.shared_file()?;
        let sibling = Self::from_parts(
            self.path.clone(),
            file,
            chunk_size,
            overlap_size,
            self.capacity,
        );
        self.release()?;
        Ok(sibling)
    }

    fn shared_file(&self) -> MapResult<Arc<File>> {
        self.file.lock().as_ref().cloned().ok_or(MapError::Closed)
    }

    /// Acquires the byte store covering `position`, using the stock
    /// [`ChunkStore`] constructor.
    pub fn acquire_byte_store(&self, position: u64) -> MapResult<ChunkRef> {
        self.acquire_byte_store_with(position, ChunkStore::new)
    }

    /// Acquires the byte store covering `position`, creating it with
    /// `factory` on a cache miss.
    ///
    /// The factory must return a store that owns the mapping in its
    /// [`ChunkParams`] and holds exactly its creator's reservation; that
    /// reservation becomes the manager's cache reservation, and the returned
    /// [`ChunkRef`] holds one more on the caller's behalf.
    ///
    /// Positions are not checked against [`capacity`](Self::capacity);
    /// callers enforce the logical bound.
    pub fn acquire_byte_store_with<F>(&self, position: u64, factory: F) -> MapResult<ChunkRef>
    where
        F: FnOnce(ChunkParams) -> Arc<ChunkStore>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(MapError::Closed);
        }
        let chunk = position / self.chunk_size;
        let index = chunk as usize;

        let mut chunks = self.chunks.lock();
        if chunks.len() <= index {
            chunks.resize_with(index + 1, || None);
        }
        if let Some(store) = &chunks[index] {
            if store.try_reserve() {
                return Ok(ChunkRef::new(Arc::clone(store)));
            }
        }

        let started = Instant::now();
        let file = self.shared_file()?;
        let min_size = (chunk + 1) * self.chunk_size + self.overlap_size;
        let mut size = os::file_size(&file)?;
        if size < min_size {
            // Double-checked growth: peer processes race on the file size,
            // so re-read it under the exclusive lock before resizing.
            let _lock = os::lock_exclusive(&file)?;
            size = os::file_size(&file)?;
            if size < min_size {
                os::resize(&file, min_size).map_err(|source| MapError::ResizeFailed {
                    requested: min_size,
                    source,
                })?;
            }
        }

        let start = chunk * self.chunk_size;
        let mapped_size = self.chunk_size + self.overlap_size;
        let mapping = os::map_region(&file, start, mapped_size)?;
        let store = factory(ChunkParams {
            start,
            mapping,
            mapped_size,
            safe_capacity: self.chunk_size + self.overlap_size / 2,
        });
        store.reserve()?;
        chunks[index] = Some(Arc::clone(&store));

        let listener = self.listener.read().clone();
        listener.on_new_chunk(&self.path, chunk, started.elapsed().as_micros() as u64);
        Ok(ChunkRef::new(store))
    }

    /// Adds a reservation on the manager itself.
    pub fn reserve(&self) -> MapResult<()> {
        self.refs.reserve()
    }

    /// Drops a reservation on the manager; the final one tears down the
    /// chunk cache and closes the file handle.
    pub fn release(&self) -> MapResult<()> {
        if self.refs.release()? {
            self.perform_release();
        }
        Ok(())
    }

    /// The manager's own reservation count.
    pub fn ref_count(&self) -> u64 {
        self.refs.count()
    }

    fn perform_release(&self) {
        let mut chunks = self.chunks.lock();
        for slot in chunks.iter_mut() {
            let Some(store) = slot else { continue };
            // Consumer ChunkRefs drop concurrently without the table lock,
            // so only release()'s own zero report decides whether this call
            // killed the store; a count snapshot would already be stale.
            match store.release() {
                Ok(true) => *slot = None,
                Ok(false) => {
                    // A consumer still holds this store; its final release
                    // performs the unmap and the slot dies with the table.
                }
                Err(e) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        error = %e,
                        "store release during manager teardown failed"
                    );
                    // Already dead; treat the entry as absent.
                    *slot = None;
                }
            }
        }
        drop(chunks);
        // Drop our handle clone. The descriptor itself closes once sibling
        // managers created by with_sizes have dropped theirs too.
        let _ = self.file.lock().take();
    }

    /// Closes the manager: idempotent, best-effort, never fails.
    ///
    /// Drains every cached store's reservations to zero on behalf of absent
    /// consumers (stale [`ChunkRef`]s observe
    /// [`MapError::AfterRelease`] from then on) and releases the manager's
    /// own reservation. Subsequent acquisitions fail with
    /// [`MapError::Closed`].
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        {
            let chunks = self.chunks.lock();
            for store in chunks.iter().flatten() {
                while store.ref_count() > 0 {
                    if let Err(e) = store.release() {
                        tracing::debug!(
                            path = %self.path.display(),
                            error = %e,
                            "chunk release during close failed"
                        );
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.release() {
            tracing::debug!(
                path = %self.path.display(),
                error = %e,
                "manager release during close failed"
            );
        }
    }

    /// Current on-disk size of the backing file.
    pub fn actual_size(&self) -> MapResult<u64> {
        let file = self.shared_file()?;
        Ok(os::file_size(&file)?)
    }

    /// Logical upper bound on positions. Advisory; see
    /// [`acquire_byte_store_with`](Self::acquire_byte_store_with).
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Effective (page-aligned) chunk size.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Effective (page-aligned) overlap size.
    pub fn overlap_size(&self) -> u64 {
        self.overlap_size
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Human-readable snapshot of the manager's count followed by the count
    /// of every cached store, 0 for dead or empty slots.
    pub fn reference_counts(&self) -> String {
        let chunks = self.chunks.lock();
        let mut out = format!("refCount: {}", self.ref_count());
        for slot in chunks.iter() {
            let count = slot.as_ref().map(|s| s.ref_count()).unwrap_or(0);
            let _ = write!(out, ", {}", count);
        }
        out
    }

    /// Replaces the chunk-materialization listener.
    pub fn set_new_chunk_listener(&self, listener: Arc<dyn NewChunkListener>) {
        *self.listener.write() = listener;
    }

    /// The current chunk-materialization listener.
    pub fn new_chunk_listener(&self) -> Arc<dyn NewChunkListener> {
        self.listener.read().clone()
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("overlap_size", &self.overlap_size)
            .field("capacity", &self.capacity)
            .field("ref_count", &self.ref_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
