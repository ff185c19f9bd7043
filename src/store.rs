//! # Chunk Stores
//!
//! A [`ChunkStore`] is one live mapped region of the backing file: a
//! page-aligned `chunk_size` window plus the trailing overlap, mapped
//! read/write. It is immutable except for its reservation count; the region
//! is unmapped exactly once, when the last reservation drops.
//!
//! ## Reservation Protocol
//!
//! A store is born holding one reservation, owned by the manager that
//! created and cached it. Consumers add reservations through
//! [`reserve`](ChunkStore::reserve) or the cache's
//! [`try_reserve`](ChunkStore::try_reserve) and pair each with exactly one
//! [`release`](ChunkStore::release). [`ChunkRef`] wraps one reservation in a
//! guard so the common path cannot leak or double-release.
//!
//! ## Access After Unmap
//!
//! The base address is published through an atomic pointer that is nulled
//! before the region is unmapped. Stale handles that outlive the last
//! release observe [`MapError::AfterRelease`] from every accessor instead of
//! touching freed address space. This is a best-effort guard against
//! misbehaving callers, not a substitute for holding a reservation.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use memmap2::MmapRaw;
use parking_lot::Mutex;

use crate::error::{MapError, MapResult};
use crate::refcount::ReferenceCounter;

/// Everything a chunk-store factory receives from the manager: the freshly
/// created mapping and its geometry.
pub struct ChunkParams {
    /// Absolute file position of byte 0 of the region.
    pub start: u64,
    /// The mapping itself; the store takes ownership and unmaps it on the
    /// final release.
    pub mapping: MmapRaw,
    /// Full mapped length, `chunk_size + overlap_size`.
    pub mapped_size: u64,
    /// Advisory write limit, `chunk_size + overlap_size / 2`.
    pub safe_capacity: u64,
}

/// A reference-counted handle to one mapped chunk of the file.
pub struct ChunkStore {
    start: u64,
    mapped_size: u64,
    safe_capacity: u64,
    address: AtomicPtr<u8>,
    mapping: Mutex<Option<MmapRaw>>,
    refs: ReferenceCounter,
}

impl ChunkStore {
    /// The stock factory: builds a store that owns `params.mapping` and
    /// holds its creator's single reservation.
    pub fn new(params: ChunkParams) -> Arc<Self> {
        let address = params.mapping.as_mut_ptr();
        Arc::new(Self {
            start: params.start,
            mapped_size: params.mapped_size,
            safe_capacity: params.safe_capacity,
            address: AtomicPtr::new(address),
            mapping: Mutex::new(Some(params.mapping)),
            refs: ReferenceCounter::new(),
        })
    }

    /// Absolute file position of byte 0 of this region.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Full mapped length including the overlap window.
    pub fn mapped_size(&self) -> u64 {
        self.mapped_size
    }

    /// Advisory capacity: bytes past this point belong to the overlap into
    /// the next chunk, and writers should roll over to the next store.
    pub fn capacity(&self) -> u64 {
        self.safe_capacity
    }

    /// Base virtual address of the mapping.
    ///
    /// Fails with [`MapError::AfterRelease`] once the region is unmapped.
    pub fn address(&self) -> MapResult<*mut u8> {
        let addr = self.address.load(Ordering::Acquire);
        if addr.is_null() {
            Err(MapError::AfterRelease)
        } else {
            Ok(addr)
        }
    }

    /// Adds a reservation. See [`ReferenceCounter::reserve`].
    pub fn reserve(&self) -> MapResult<()> {
        self.refs.reserve()
    }

    /// Adds a reservation unless the store is already dead.
    pub fn try_reserve(&self) -> bool {
        self.refs.try_reserve()
    }

    /// Drops a reservation; the final one unmaps the region. Returns
    /// whether this call was the one that dropped the count to zero.
    pub fn release(&self) -> MapResult<bool> {
        let was_last = self.refs.release()?;
        if was_last {
            self.unmap();
        }
        Ok(was_last)
    }

    /// Current reservation count.
    pub fn ref_count(&self) -> u64 {
        self.refs.count()
    }

    fn unmap(&self) {
        // Null the published address first so late accessors fail with
        // AfterRelease rather than reading a dying mapping.
        self.address.store(ptr::null_mut(), Ordering::Release);
        let _ = self.mapping.lock().take();
    }

    fn check_range(&self, offset: u64, len: u64) -> MapResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| MapError::invalid_argument("range overflows u64"))?;
        if end > self.mapped_size {
            return Err(MapError::invalid_argument(format!(
                "range {}..{} exceeds mapped size {}",
                offset, end, self.mapped_size
            )));
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes out of the region starting at `offset`
    /// (relative to [`start`](Self::start)).
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> MapResult<()> {
        self.check_range(offset, buf.len() as u64)?;
        let addr = self.address()?;
        // SAFETY: the range was bounds-checked against mapped_size and the
        // address is non-null, so the source span lies inside the live
        // mapping. The caller holds a reservation, which keeps the mapping
        // alive for the duration of the copy. Raw copies avoid materializing
        // a &[u8] over memory that peer processes may mutate concurrently.
        unsafe {
            ptr::copy_nonoverlapping(addr.add(offset as usize), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copies `data` into the region starting at `offset` (relative to
    /// [`start`](Self::start)).
    pub fn write_at(&self, offset: u64, data: &[u8]) -> MapResult<()> {
        self.check_range(offset, data.len() as u64)?;
        let addr = self.address()?;
        // SAFETY: same bounds and liveness argument as read_at. Concurrent
        // writers to the same span race at byte granularity, exactly as two
        // processes sharing the mapping would; serializing them is the
        // caller's concern.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), addr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Borrows `len` bytes of the region at `offset` without copying.
    ///
    /// # Safety
    ///
    /// The caller must hold a reservation for the lifetime of the slice and
    /// must not write to the span (through this store, another store's
    /// overlap, or a peer process) while the borrow is live.
    pub unsafe fn slice(&self, offset: u64, len: u64) -> MapResult<&[u8]> {
        self.check_range(offset, len)?;
        let addr = self.address()?;
        Ok(std::slice::from_raw_parts(
            addr.add(offset as usize),
            len as usize,
        ))
    }

    /// Asks the OS to flush the mapped region to the backing file.
    pub fn flush(&self) -> MapResult<()> {
        let guard = self.mapping.lock();
        match guard.as_ref() {
            Some(mapping) => Ok(mapping.flush()?),
            None => Err(MapError::AfterRelease),
        }
    }

    /// Hints to the OS that the whole region will be read soon. Errors are
    /// ignored; this is advisory only.
    pub fn prefetch(&self) {
        #[cfg(unix)]
        {
            let guard = self.mapping.lock();
            if let Some(mapping) = guard.as_ref() {
                let _ = mapping.advise(memmap2::Advice::WillNeed);
            }
        }
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("start", &self.start)
            .field("mapped_size", &self.mapped_size)
            .field("safe_capacity", &self.safe_capacity)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// A guard holding one reservation on a [`ChunkStore`], released on drop.
///
/// Dereferences to the store. Dropping after the store was force-drained by
/// [`MappedFile::close`](crate::mapped_file::MappedFile::close) logs the
/// resulting underflow at debug level rather than panicking; shutdown is
/// best-effort by design.
pub struct ChunkRef {
    store: Arc<ChunkStore>,
}

impl ChunkRef {
    pub(crate) fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }

    /// The shared store this guard reserves. Cloning the `Arc` shares the
    /// allocation only; it does not add a reservation.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }
}

impl std::ops::Deref for ChunkRef {
    type Target = ChunkStore;

    fn deref(&self) -> &ChunkStore {
        &self.store
    }
}

impl Drop for ChunkRef {
    fn drop(&mut self) {
        if let Err(e) = self.store.release() {
            tracing::debug!(
                start = self.store.start(),
                error = %e,
                "chunk reservation released after store teardown"
            );
        }
    }
}

impl std::fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChunkRef").field(&self.store).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn mapped_store(len: u64) -> (Arc<ChunkStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("store.dat"))
            .unwrap();
        os::resize(&file, len).unwrap();
        let mapping = os::map_region(&file, 0, len).unwrap();
        let store = ChunkStore::new(ChunkParams {
            start: 0,
            mapping,
            mapped_size: len,
            safe_capacity: len,
        });
        (store, dir)
    }

    #[test]
    fn read_back_what_was_written() {
        let page = os::page_size();
        let (store, _dir) = mapped_store(page);

        store.write_at(100, b"hello chunk").unwrap();
        let mut buf = [0u8; 11];
        store.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello chunk");
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let page = os::page_size();
        let (store, _dir) = mapped_store(page);

        let mut buf = [0u8; 16];
        let err = store.read_at(page - 8, &mut buf).unwrap_err();
        assert!(matches!(err, MapError::InvalidArgument(_)));
    }

    #[test]
    fn final_release_unmaps_and_poisons_accessors() {
        let page = os::page_size();
        let (store, _dir) = mapped_store(page);

        assert_eq!(store.ref_count(), 1);
        store.release().unwrap();

        assert!(matches!(store.address(), Err(MapError::AfterRelease)));
        assert!(matches!(store.flush(), Err(MapError::AfterRelease)));
        assert!(!store.try_reserve());
    }

    #[test]
    fn chunk_ref_releases_on_drop() {
        let page = os::page_size();
        let (store, _dir) = mapped_store(page);

        store.reserve().unwrap();
        let guard = ChunkRef::new(Arc::clone(&store));
        assert_eq!(store.ref_count(), 2);
        drop(guard);
        assert_eq!(store.ref_count(), 1);
    }

    #[test]
    fn flush_persists_without_error() {
        let page = os::page_size();
        let (store, _dir) = mapped_store(page);

        store.write_at(0, &[7u8; 64]).unwrap();
        store.flush().unwrap();
        store.prefetch();
    }
}
