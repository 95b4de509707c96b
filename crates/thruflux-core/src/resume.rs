//! Durable resume cursor for the receiver.
//!
//! The cursor `(file_id, offset)` marks the prefix of the logical byte
//! sequence that is durably on disk. It is persisted per manifest
//! fingerprint as a 12-byte little-endian file, written via a temporary
//! file and an atomic rename so a crash can never leave a torn cursor.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};

use crate::constants::{
    RESUME_FLUSH_INTERVAL, RESUME_STATE_LEN, RESUME_STATE_PREFIX, RESUME_STATE_SUFFIX,
};
use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// Position in the logical byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResumeCursor {
    pub file_id: u32,
    pub offset: u64,
}

impl ResumeCursor {
    pub const ZERO: ResumeCursor = ResumeCursor {
        file_id: 0,
        offset: 0,
    };

    fn to_bytes(self) -> [u8; RESUME_STATE_LEN] {
        let mut out = [0u8; RESUME_STATE_LEN];
        out[..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; RESUME_STATE_LEN]) -> Self {
        Self {
            file_id: u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[4..].try_into().unwrap()),
        }
    }
}

/// Resume state file path for a manifest fingerprint, inside `dir`.
pub fn state_path(dir: &Path, fingerprint: u64) -> PathBuf {
    dir.join(format!(
        "{RESUME_STATE_PREFIX}{fingerprint}{RESUME_STATE_SUFFIX}"
    ))
}

/// Clamp a cursor against the manifest and advance it past finished and
/// zero-size files. A cursor at or past the end normalizes to
/// `(file_count, 0)`, the terminal position.
pub fn normalize(mut cursor: ResumeCursor, manifest: &Manifest) -> ResumeCursor {
    let count = manifest.file_count();
    if cursor.file_id >= count {
        return ResumeCursor {
            file_id: count,
            offset: 0,
        };
    }
    if let Some(size) = manifest.size_of(cursor.file_id) {
        cursor.offset = cursor.offset.min(size);
    }
    while cursor.file_id < count
        && cursor.offset >= manifest.size_of(cursor.file_id).unwrap_or(0)
    {
        cursor.file_id += 1;
        cursor.offset = 0;
    }
    cursor
}

/// Owns the durable cursor and its flush policy.
#[derive(Debug)]
pub struct ResumeStore {
    path: PathBuf,
    cursor: ResumeCursor,
    dirty: bool,
    last_flush: Option<Instant>,
}

impl ResumeStore {
    /// Load the cursor for `fingerprint` from `dir`.
    ///
    /// With `overwrite` the state file is deleted and the cursor starts at
    /// zero. A missing file also starts at zero. A corrupt file resets to
    /// zero with a warning; this is the one non-fatal parse failure in the
    /// pipeline.
    pub fn load(dir: &Path, fingerprint: u64, overwrite: bool) -> Result<Self> {
        let path = state_path(dir, fingerprint);

        if overwrite {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "overwrite: removed resume state"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(Self::fresh(path));
        }

        // A store with no on-disk backing yet is born dirty so the first
        // flush materializes the state file.
        let (cursor, dirty) = match fs::read(&path) {
            Ok(bytes) => match <[u8; RESUME_STATE_LEN]>::try_from(bytes.as_slice()) {
                Ok(raw) => {
                    let cursor = ResumeCursor::from_bytes(&raw);
                    debug!(
                        path = %path.display(),
                        file_id = cursor.file_id,
                        offset = cursor.offset,
                        "loaded resume state"
                    );
                    (cursor, false)
                }
                Err(_) => {
                    let err = Error::ResumeStateCorrupt {
                        message: format!("{} bytes, expected {RESUME_STATE_LEN}", bytes.len()),
                    };
                    warn!(path = %path.display(), error = %err, "resetting resume cursor");
                    (ResumeCursor::ZERO, true)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (ResumeCursor::ZERO, true),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            cursor,
            dirty,
            last_flush: None,
        })
    }

    fn fresh(path: PathBuf) -> Self {
        Self {
            path,
            cursor: ResumeCursor::ZERO,
            dirty: true,
            last_flush: None,
        }
    }

    pub fn cursor(&self) -> ResumeCursor {
        self.cursor
    }

    /// Move the cursor forward. The cursor is monotonic within a transfer.
    pub fn advance(&mut self, cursor: ResumeCursor) {
        debug_assert!(cursor >= self.cursor, "resume cursor moved backwards");
        if cursor != self.cursor {
            self.cursor = cursor;
            self.dirty = true;
        }
    }

    /// Force the cursor for normalization at load time, where clamping may
    /// legitimately move it backwards (a shrunken offset).
    pub fn reset(&mut self, cursor: ResumeCursor) {
        if cursor != self.cursor {
            self.cursor = cursor;
            self.dirty = true;
        }
    }

    /// Write the cursor durably: temp file, fsync, atomic rename.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("state.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&self.cursor.to_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        self.last_flush = Some(Instant::now());
        Ok(())
    }

    /// Timer-driven flush, at most once per `RESUME_FLUSH_INTERVAL`.
    pub fn maybe_flush(&mut self, now: Instant) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let due = match self.last_flush {
            Some(at) => now.duration_since(at) >= RESUME_FLUSH_INTERVAL,
            None => true,
        };
        if due {
            self.flush()?;
            self.last_flush = Some(now);
        }
        Ok(())
    }
}
