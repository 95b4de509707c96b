//! Error types for thruflux-core.

use thiserror::Error;

/// Main error type for transfer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest failed strict decoding.
    #[error("malformed manifest: {message}")]
    ManifestMalformed { message: String },

    /// A manifest path would escape the output root.
    #[error("unsafe path in manifest: {path:?}")]
    PathUnsafe { path: String },

    /// Best-effort preallocation failed; callers fall back to plain writes.
    #[error("preallocation failed for {path:?}: {source}")]
    PreallocFailed {
        path: String,
        source: std::io::Error,
    },

    /// Every file-handle cache slot is pinned.
    #[error("file-handle cache exhausted (capacity {capacity})")]
    CacheExhausted { capacity: usize },

    /// Reading a source file failed or came up short of file end.
    #[error("read failed for file {file_id} at offset {offset}: {message}")]
    ReadFailed {
        file_id: u32,
        offset: u64,
        message: String,
    },

    /// Writing a destination file failed.
    #[error("write failed for file {file_id} at offset {offset}: {source}")]
    WriteFailed {
        file_id: u32,
        offset: u64,
        source: std::io::Error,
    },

    /// The disk accepted only part of a chunk. The cursor stays at the
    /// last fully written byte.
    #[error("short write for file {file_id}: {written} of {expected} bytes at offset {offset}")]
    ShortWrite {
        file_id: u32,
        offset: u64,
        expected: usize,
        written: usize,
    },

    /// The resume state file could not be parsed; the cursor resets to zero.
    #[error("resume state corrupt: {message}")]
    ResumeStateCorrupt { message: String },

    /// The peer closed the connection before the transfer completed.
    #[error("transport closed before completion")]
    TransportClosed,

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// TLS certificate error.
    #[error("certificate error: {message}")]
    Certificate { message: String },

    /// Protocol violation on a control or data stream.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Invalid configuration value.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl Error {
    /// Returns true if this error must tear down the connection.
    ///
    /// Preallocation failures and corrupt resume state are recoverable in
    /// place: the receiver proceeds without the optimization or resets the
    /// cursor to zero. Everything else closes the connection; the durable
    /// resume cursor remains authoritative.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::PreallocFailed { .. } | Error::ResumeStateCorrupt { .. }
        )
    }
}

/// Convenience result type for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;
