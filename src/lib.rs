//! # chunkfile - Chunked, Overlapping Memory-Mapped Files
//!
//! chunkfile presents a sparse file of large logical capacity (2^40 bytes by
//! default) as an on-demand set of fixed-size memory-mapped regions. Each
//! region is extended by a trailing overlap window so records that straddle
//! a chunk boundary can be read and written contiguously, with no stitching
//! at the seam.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chunkfile::MappedFile;
//!
//! let mf = MappedFile::open("queue.dat", 64 * 1024)?;
//!
//! let mut writer = mf.acquire_bytes_for_write(0)?;
//! writer.write_u64(record_count)?;
//! writer.write_bytes(&payload)?;
//!
//! let mut reader = mf.acquire_bytes_for_read(0)?;
//! let count = reader.read_u64()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------+
//! |        MappedBytes (cursor views)          |
//! +--------------------------------------------+
//! |   MappedFile (chunk table, growth, close)  |
//! +--------------------------------------------+
//! |  ChunkStore + ChunkRef (one region each)   |
//! +---------------------+----------------------+
//! |  ReferenceCounter   |  os (map/lock/size)  |
//! +---------------------+----------------------+
//! ```
//!
//! A caller asks the manager for the byte store covering an absolute file
//! position. The manager returns the cached [`ChunkStore`] when one is
//! live; otherwise it grows the file (serialized across processes by a
//! whole-file advisory lock), maps the region, caches it, and returns it.
//! Every handout carries a reservation, dropped by RAII; a region is
//! unmapped exactly once, when the manager's cache reservation and all
//! consumer reservations are gone.
//!
//! ## Sharing Across Processes
//!
//! The file carries no header and no metadata; its bytes are exactly the
//! logical byte stream. Cooperating processes open the same path, grow the
//! file under the same advisory lock, and observe each other's writes
//! through the shared pages, overlap windows included.
//!
//! ## Module Overview
//!
//! - [`mapped_file`]: the manager: chunk table, growth protocol, lifecycle
//! - [`store`]: one mapped region with its reservation count
//! - [`bytes`]: cursor views bound to a store
//! - [`refcount`]: the reservation counter both levels share
//! - [`os`]: page alignment, offset mapping, scoped advisory file lock
//! - [`error`]: the [`MapError`] taxonomy

pub mod bytes;
pub mod error;
pub mod mapped_file;
pub mod os;
pub mod refcount;
pub mod store;

pub use bytes::MappedBytes;
pub use error::{MapError, MapResult};
pub use mapped_file::{MappedFile, NewChunkListener, DEFAULT_CAPACITY};
pub use refcount::ReferenceCounter;
pub use store::{ChunkParams, ChunkRef, ChunkStore};
