//! The file catalogue exchanged once at the start of a transfer.
//!
//! File ids are dense, zero-based, and assigned by sorting relative paths
//! lexicographically, so the same input set always produces the same
//! manifest. The logical byte sequence — the unit of resume — is the
//! concatenation of all files in ascending id order.

pub mod codec;
mod proptest;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One file record in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Dense index; equals the record's position in the manifest.
    pub id: u32,
    /// File size in bytes.
    pub size: u64,
    /// Forward-slash relative path, never absolute.
    pub relative_path: String,
}

/// Ordered file catalogue.
///
/// Invariant: records are sorted by `relative_path`, ids equal positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    files: Vec<FileEntry>,
    total_bytes: u64,
}

impl Manifest {
    /// Build a manifest from `(relative_path, size)` pairs.
    ///
    /// Sorts by path and assigns ids. Paths are validated with the same
    /// rules the decoder applies, so a manifest that encodes also decodes.
    pub fn from_listing(listing: Vec<(String, u64)>) -> Result<Self> {
        let mut listing = listing;
        listing.sort_by(|a, b| a.0.cmp(&b.0));

        let mut files = Vec::with_capacity(listing.len());
        let mut total_bytes = 0u64;
        let mut prev: Option<&str> = None;
        for (i, (relative_path, size)) in listing.iter().enumerate() {
            codec::check_path(relative_path)?;
            if prev == Some(relative_path.as_str()) {
                return Err(Error::Config {
                    message: format!("duplicate relative path {relative_path:?} in input set"),
                });
            }
            total_bytes += size;
            files.push(FileEntry {
                id: i as u32,
                size: *size,
                relative_path: relative_path.clone(),
            });
            prev = Some(relative_path.as_str());
        }

        Ok(Self { files, total_bytes })
    }

    pub(crate) fn from_decoded(files: Vec<FileEntry>) -> Self {
        let total_bytes = files.iter().map(|f| f.size).sum();
        Self { files, total_bytes }
    }

    /// All records in ascending id order.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Number of files.
    pub fn file_count(&self) -> u32 {
        self.files.len() as u32
    }

    /// Sum of all file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Size of the file with the given id, if it exists.
    pub fn size_of(&self, id: u32) -> Option<u64> {
        self.files.get(id as usize).map(|f| f.size)
    }

    /// Position of `(file_id, offset)` in the logical byte sequence.
    pub fn logical_offset(&self, file_id: u32, offset: u64) -> u64 {
        let prefix: u64 = self
            .files
            .iter()
            .take(file_id as usize)
            .map(|f| f.size)
            .sum();
        prefix + offset
    }
}

/// Sender-side file record: a manifest entry plus its on-disk location.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: u32,
    pub size: u64,
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

/// Sender-side catalogue: the manifest, its encoded blob, and the source
/// paths behind each entry. Built once, shared read-only by every
/// connection's pipeline.
#[derive(Debug)]
pub struct SourceIndex {
    files: Vec<SourceFile>,
    manifest: Manifest,
    blob: Vec<u8>,
    fingerprint: u64,
}

impl SourceIndex {
    /// Walk the input paths and build the catalogue.
    ///
    /// A bare file contributes its file name; a directory contributes every
    /// regular file beneath it, relative to the directory's parent. Inputs
    /// that do not exist are skipped with a warning, as are entries whose
    /// names are not valid UTF-8.
    pub fn scan(paths: &[PathBuf]) -> Result<Self> {
        let mut raw: Vec<(String, u64, PathBuf)> = Vec::new();

        for path in paths {
            let meta = match fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping input path");
                    continue;
                }
            };
            if meta.is_file() {
                match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => raw.push((name.to_string(), meta.len(), path.clone())),
                    None => warn!(path = %path.display(), "skipping non-UTF-8 file name"),
                }
            } else if meta.is_dir() {
                let base = path.parent().unwrap_or(Path::new("")).to_path_buf();
                walk_dir(path, &base, &mut raw)?;
            }
        }

        raw.sort_by(|a, b| a.0.cmp(&b.0));

        let listing: Vec<(String, u64)> = raw.iter().map(|(p, s, _)| (p.clone(), *s)).collect();
        let manifest = Manifest::from_listing(listing)?;
        let blob = codec::encode(&manifest);
        let fingerprint = codec::fingerprint(&blob);

        let files = raw
            .into_iter()
            .enumerate()
            .map(|(i, (relative_path, size, absolute_path))| SourceFile {
                id: i as u32,
                size,
                relative_path,
                absolute_path,
            })
            .collect::<Vec<_>>();

        debug!(
            files = files.len(),
            total_bytes = manifest.total_bytes(),
            fingerprint,
            "source index built"
        );

        Ok(Self {
            files,
            manifest,
            blob,
            fingerprint,
        })
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The encoded manifest, written verbatim on the manifest stream.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// 64-bit FNV-1a of the encoded manifest.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn file_count(&self) -> u32 {
        self.files.len() as u32
    }

    pub fn total_bytes(&self) -> u64 {
        self.manifest.total_bytes()
    }
}

fn walk_dir(dir: &Path, base: &Path, out: &mut Vec<(String, u64, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            walk_dir(&path, base, out)?;
        } else if file_type.is_file() {
            let size = entry.metadata()?.len();
            match relative_slash_path(&path, base) {
                Some(rel) => out.push((rel, size, path)),
                None => warn!(path = %path.display(), "skipping non-UTF-8 path"),
            }
        }
        // Symlinks and special files are not transferred.
    }
    Ok(())
}

/// Express `path` relative to `base` with forward-slash separators.
fn relative_slash_path(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        parts.push(comp.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}
