//! # Cursor Views Over Chunk Stores
//!
//! [`MappedBytes`] is a bounds-checked cursor bound to one [`ChunkStore`].
//! It owns the reservation it was bound with, so the mapping outlives the
//! cursor no matter what the manager does meanwhile. Positions are absolute
//! file positions; the cursor translates them to offsets inside its store's
//! mapping.
//!
//! Read cursors obtained from
//! [`MappedFile::acquire_bytes_for_read`] extend to the end of the mapped
//! region, overlap included, so a record straddling the chunk boundary can
//! be read contiguously through the lower chunk. Write cursors stop at the
//! store's safe capacity; running into that limit is the signal to roll to
//! the next chunk.

use crate::error::{MapError, MapResult};
use crate::mapped_file::MappedFile;
use crate::store::ChunkRef;

/// A single-position cursor over one mapped chunk.
///
/// All I/O advances the position and fails with
/// [`MapError::InvalidArgument`] past the limit, leaving the position
/// unchanged.
#[derive(Debug)]
pub struct MappedBytes {
    store: Option<ChunkRef>,
    start: u64,
    position: u64,
    limit: u64,
}

impl MappedBytes {
    /// A cursor bound to nothing; every I/O op fails until
    /// [`bind`](Self::bind) attaches a store.
    pub fn unbound() -> Self {
        Self {
            store: None,
            start: 0,
            position: 0,
            limit: 0,
        }
    }

    pub(crate) fn bound(store: ChunkRef, position: u64, limit: u64) -> MapResult<Self> {
        let mut bytes = Self::unbound();
        bytes.bind(store, position, limit)?;
        Ok(bytes)
    }

    /// Attaches `store` with the window `[position, limit)`, releasing any
    /// previously bound store.
    ///
    /// The window must lie inside the store's mapped region and `position`
    /// must not exceed `limit`.
    pub fn bind(&mut self, store: ChunkRef, position: u64, limit: u64) -> MapResult<()> {
        let start = store.start();
        let end = start + store.mapped_size();
        if position < start || limit > end || position > limit {
            return Err(MapError::invalid_argument(format!(
                "window {}..{} outside mapped region {}..{}",
                position, limit, start, end
            )));
        }
        self.start = start;
        self.position = position;
        self.limit = limit;
        self.store = Some(store);
        Ok(())
    }

    /// Detaches and releases the bound store, if any.
    pub fn unbind(&mut self) {
        self.store = None;
    }

    pub fn is_bound(&self) -> bool {
        self.store.is_some()
    }

    /// Absolute position of the next read or write.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the cursor within its window.
    pub fn set_position(&mut self, position: u64) -> MapResult<()> {
        if position < self.start || position > self.limit {
            return Err(MapError::invalid_argument(format!(
                "position {} outside window {}..{}",
                position, self.start, self.limit
            )));
        }
        self.position = position;
        Ok(())
    }

    /// Absolute exclusive end of the window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes left before the limit.
    pub fn remaining(&self) -> u64 {
        self.limit - self.position
    }

    /// Validates that `len` bytes fit before the limit and returns the
    /// offset of the current position inside the store's mapping.
    fn span(&self, len: u64) -> MapResult<u64> {
        if self.store.is_none() {
            return Err(MapError::invalid_argument("cursor is not bound to a store"));
        }
        let end = self
            .position
            .checked_add(len)
            .ok_or_else(|| MapError::invalid_argument("cursor range overflows u64"))?;
        if end > self.limit {
            return Err(MapError::invalid_argument(format!(
                "read/write of {} bytes at {} exceeds limit {}",
                len, self.position, self.limit
            )));
        }
        Ok(self.position - self.start)
    }

    fn store(&self) -> &ChunkRef {
        // span() is always called first and fails on an unbound cursor.
        match &self.store {
            Some(store) => store,
            None => unreachable!("span() guarantees a bound store"),
        }
    }

    /// Copies `buf.len()` bytes from the cursor position into `buf`.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> MapResult<()> {
        let off = self.span(buf.len() as u64)?;
        self.store().read_at(off, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Copies `data` to the cursor position.
    pub fn write_bytes(&mut self, data: &[u8]) -> MapResult<()> {
        let off = self.span(data.len() as u64)?;
        self.store().write_at(off, data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Borrows `len` bytes at the cursor position without copying and
    /// advances past them.
    ///
    /// The bytes live in the shared mapping: a writer in this process or a
    /// peer process can change them while the borrow is live. Use
    /// [`read_bytes`](Self::read_bytes) where a stable snapshot matters.
    pub fn read_slice(&mut self, len: u64) -> MapResult<&[u8]> {
        let off = self.span(len)?;
        self.position += len;
        // SAFETY: span() bounds-checked the range against the window, which
        // bind() confined to the mapped region, and the cursor's ChunkRef
        // keeps the mapping alive for the borrow's lifetime.
        unsafe { self.store().slice(off, len) }
    }

    pub fn read_u8(&mut self) -> MapResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&mut self) -> MapResult<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> MapResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&mut self, v: u8) -> MapResult<()> {
        self.write_bytes(&[v])
    }

    pub fn write_u32(&mut self, v: u32) -> MapResult<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> MapResult<()> {
        self.write_bytes(&v.to_le_bytes())
    }
}

impl MappedFile {
    /// Acquires a read cursor at `position` whose window runs to the end of
    /// the chunk's mapped region, overlap included.
    pub fn acquire_bytes_for_read(&self, position: u64) -> MapResult<MappedBytes> {
        let store = self.acquire_byte_store(position)?;
        let limit = store.start() + store.mapped_size();
        MappedBytes::bound(store, position, limit)
    }

    /// Acquires a write cursor at `position` whose window runs to the
    /// chunk's safe capacity; hitting the limit signals rolling to the next
    /// chunk.
    pub fn acquire_bytes_for_write(&self, position: u64) -> MapResult<MappedBytes> {
        let store = self.acquire_byte_store(position)?;
        let limit = store.start() + store.capacity();
        MappedBytes::bound(store, position, limit)
    }

    /// Rebinds a caller-provided cursor for reading at `position`; the
    /// window runs to the chunk's safe capacity.
    pub fn acquire_bytes_for_read_into(
        &self,
        position: u64,
        bytes: &mut MappedBytes,
    ) -> MapResult<()> {
        let store = self.acquire_byte_store(position)?;
        let limit = store.start() + store.capacity();
        bytes.bind(store, position, limit)
    }

    /// Rebinds a caller-provided cursor for writing at `position`; the
    /// window runs to the chunk's safe capacity.
    pub fn acquire_bytes_for_write_into(
        &self,
        position: u64,
        bytes: &mut MappedBytes,
    ) -> MapResult<()> {
        let store = self.acquire_byte_store(position)?;
        let limit = store.start() + store.capacity();
        bytes.bind(store, position, limit)
    }
}
