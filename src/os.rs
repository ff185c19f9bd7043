//! # Platform Mapping Primitives
//!
//! Thin wrappers around the OS services the chunk manager needs: page-size
//! queries, page alignment, mapping a byte range of a file into memory,
//! resizing a file, and a scoped whole-file advisory lock.
//!
//! All fallible operations return `std::io::Error` so callers can wrap them
//! into [`MapError`](crate::error::MapError) with whatever context they have.
//! There is no partial success: a failed call leaves the file and the address
//! space unchanged.
//!
//! ## Advisory Lock Scope
//!
//! [`lock_exclusive`] returns a guard that releases the lock on drop, so the
//! lock cannot leak across an early return or a panic. The lock is a
//! whole-file lock and a process can only hold one per file; callers must not
//! also take it through another handle to the same open file description.

use std::fs::File;
use std::io;

use fs4::fs_std::FileExt;
use memmap2::{MmapOptions, MmapRaw};

/// Returns the OS page size in bytes.
pub fn page_size() -> u64 {
    page_size::get() as u64
}

/// Rounds `n` up to the nearest multiple of the OS page size.
///
/// `map_align(0) == 0`; all other values round up, so any strictly positive
/// input yields at least one page.
pub fn map_align(n: u64) -> u64 {
    let page = page_size();
    n.div_ceil(page) * page
}

/// Maps `len` bytes of `file` starting at `offset` with read/write access.
///
/// `offset` must be page-aligned and the file must already span
/// `offset + len` bytes; growing the file is the caller's job.
pub fn map_region(file: &File, offset: u64, len: u64) -> io::Result<MmapRaw> {
    MmapOptions::new()
        .offset(offset)
        .len(len as usize)
        .map_raw(file)
}

/// Returns the current on-disk size of `file`.
pub fn file_size(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Extends or truncates `file` to exactly `len` bytes.
pub fn resize(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len)
}

/// A scoped exclusive advisory lock over a whole file.
///
/// Released on drop. Unlock failures are logged and swallowed; there is
/// nothing a caller could do about them on an unwind path.
pub struct FileLockGuard<'a> {
    file: &'a File,
}

/// Takes the whole-file exclusive advisory lock, blocking until it is
/// available. Peer processes contending for file growth serialize here.
pub fn lock_exclusive(file: &File) -> io::Result<FileLockGuard<'_>> {
    FileExt::lock_exclusive(file)?;
    Ok(FileLockGuard { file })
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            tracing::debug!(error = %e, "failed to release advisory file lock");
        }
    }
}
