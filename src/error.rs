//! Error types for chunked mapped-file operations.

use std::io;

/// A specialized error type for mapped-file operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Operation attempted after `close()`.
    #[error("mapped file is closed")]
    Closed,
    /// An argument was out of range or otherwise invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An I/O error occurred during a map, resize, lock, or close syscall.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A file resize under the growth protocol failed.
    #[error("failed to resize file to {requested} bytes")]
    ResizeFailed {
        requested: u64,
        #[source]
        source: io::Error,
    },
    /// `release()` was called more times than `reserve()`.
    #[error("reference count underflow: release() without matching reserve()")]
    RefCountUnderflow,
    /// `reserve()` or `try_reserve()` was called on a handle whose count
    /// already reached zero.
    #[error("resource already released")]
    AfterRelease,
}

impl MapError {
    /// Create an invalid-argument error from a displayable value.
    pub fn invalid_argument<T: std::fmt::Display>(msg: T) -> Self {
        Self::InvalidArgument(msg.to_string())
    }
}

/// A Result type alias for mapped-file operations.
pub type MapResult<T> = Result<T, MapError>;
