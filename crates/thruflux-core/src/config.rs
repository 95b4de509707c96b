//! Transfer configuration consumed by the pipelines.
//!
//! The core does not parse anything; the enclosing application hands it a
//! validated `TransferConfig` value.

use std::path::PathBuf;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FD_CACHE_CAPACITY, DEFAULT_PREALLOC_THRESHOLD, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
use crate::error::{Error, Result};

/// Settings shared by the sender and receiver pipelines.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// I/O buffer size for chunked reads and writes.
    pub chunk_size: usize,
    /// Files at or above this size are preallocated on the receiver.
    pub prealloc_threshold: u64,
    /// Capacity of the per-connection file-handle cache.
    pub fd_cache_capacity: usize,
    /// Ignore any existing resume state and start from zero.
    pub overwrite: bool,
    /// Receiver root; all manifest paths are resolved beneath it.
    pub output_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            prealloc_threshold: DEFAULT_PREALLOC_THRESHOLD,
            fd_cache_capacity: DEFAULT_FD_CACHE_CAPACITY,
            overwrite: false,
            output_dir: PathBuf::from("."),
        }
    }
}

impl TransferConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the preallocation threshold.
    pub fn with_prealloc_threshold(mut self, threshold: u64) -> Self {
        self.prealloc_threshold = threshold;
        self
    }

    /// Set the file-handle cache capacity.
    pub fn with_fd_cache_capacity(mut self, capacity: usize) -> Self {
        self.fd_cache_capacity = capacity;
        self
    }

    /// Set the overwrite flag.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the receiver output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Validate ranges and clamp the chunk size into its supported window.
    pub fn validate(mut self) -> Result<Self> {
        if self.fd_cache_capacity == 0 {
            return Err(Error::Config {
                message: "fd_cache_capacity must be at least 1".into(),
            });
        }
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        Ok(self)
    }
}
