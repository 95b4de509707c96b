//! Deterministic binary codec for the manifest.
//!
//! Wire layout, all integers little-endian:
//!
//! ```text
//! count: u32
//! repeat count times:
//!   id:      u32   (must equal the record's position)
//!   size:    u64
//!   pathLen: u16   (non-zero)
//!   path:    pathLen bytes, UTF-8, forward-slash separated
//! ```
//!
//! Decoding is strict: truncation, trailing bytes, id gaps, empty or unsafe
//! paths all fail. The 64-bit FNV-1a of the encoded blob is the manifest
//! fingerprint and names the receiver's resume state file.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::error::{Error, Result};

use super::{FileEntry, Manifest};

/// Fixed bytes per record before the path: id + size + pathLen.
const RECORD_HEADER_LEN: usize = 4 + 8 + 2;

/// Encode a manifest into its canonical byte form.
pub fn encode(manifest: &Manifest) -> Vec<u8> {
    let files = manifest.files();
    let cap = 4 + files
        .iter()
        .map(|f| RECORD_HEADER_LEN + f.relative_path.len())
        .sum::<usize>();
    let mut out = Vec::with_capacity(cap);

    out.extend_from_slice(&(files.len() as u32).to_le_bytes());
    for f in files {
        out.extend_from_slice(&f.id.to_le_bytes());
        out.extend_from_slice(&f.size.to_le_bytes());
        out.extend_from_slice(&(f.relative_path.len() as u16).to_le_bytes());
        out.extend_from_slice(f.relative_path.as_bytes());
    }
    out
}

/// Decode and validate a manifest blob.
pub fn decode(blob: &[u8]) -> Result<Manifest> {
    let mut buf = blob;
    let count = u32::from_le_bytes(take(&mut buf, 4, "count")?.try_into().unwrap());

    let mut files = Vec::with_capacity(count.min(1 << 16) as usize);
    for i in 0..count {
        let header = take(&mut buf, RECORD_HEADER_LEN, "record header")?;
        let id = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let size = u64::from_le_bytes(header[4..12].try_into().unwrap());
        let path_len = u16::from_le_bytes(header[12..14].try_into().unwrap());

        if id != i {
            return Err(Error::ManifestMalformed {
                message: format!("record {i} carries id {id}"),
            });
        }
        if path_len == 0 {
            return Err(Error::ManifestMalformed {
                message: format!("record {i} has empty path"),
            });
        }

        let raw = take(&mut buf, path_len as usize, "path")?;
        let relative_path =
            std::str::from_utf8(raw).map_err(|_| Error::ManifestMalformed {
                message: format!("record {i} path is not UTF-8"),
            })?;
        check_path(relative_path)?;

        files.push(FileEntry {
            id,
            size,
            relative_path: relative_path.to_string(),
        });
    }

    if !buf.is_empty() {
        return Err(Error::ManifestMalformed {
            message: format!("{} trailing bytes after last record", buf.len()),
        });
    }

    Ok(Manifest::from_decoded(files))
}

fn take<'a>(buf: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::ManifestMalformed {
            message: format!("truncated {what}"),
        });
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

/// 64-bit FNV-1a over the encoded manifest.
pub fn fingerprint(blob: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(blob);
    hasher.finish()
}

/// Reject any path that could land outside the receiver root.
///
/// Forward-slash separated relative paths only: no NUL, no backslash, no
/// absolute prefix, no drive letter, and no `.`/`..`/empty components.
pub fn check_path(path: &str) -> Result<()> {
    let unsafe_path = || Error::PathUnsafe {
        path: path.to_string(),
    };

    if path.is_empty() || path.len() > u16::MAX as usize {
        return Err(unsafe_path());
    }
    if path.contains('\0') || path.contains('\\') {
        return Err(unsafe_path());
    }
    if path.starts_with('/') {
        return Err(unsafe_path());
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(unsafe_path());
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(unsafe_path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest::from_listing(vec![
            ("dir/a.bin".into(), 1024),
            ("dir/sub/b.bin".into(), 0),
            ("hello.txt".into(), 13),
        ])
        .unwrap()
    }

    #[test]
    fn roundtrip() {
        let manifest = sample();
        let blob = encode(&manifest);
        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode(&sample());
        let b = encode(&sample());
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = encode(&sample());
        let b = encode(&Manifest::from_listing(vec![("hello.txt".into(), 14)]).unwrap());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn empty_manifest_roundtrips() {
        let manifest = Manifest::from_listing(vec![]).unwrap();
        let decoded = decode(&encode(&manifest)).unwrap();
        assert_eq!(decoded.file_count(), 0);
    }

    #[test]
    fn truncation_fails() {
        let blob = encode(&sample());
        for cut in [0, 3, 4, 10, blob.len() - 1] {
            assert!(
                matches!(
                    decode(&blob[..cut]),
                    Err(Error::ManifestMalformed { .. })
                ),
                "cut at {cut} must fail"
            );
        }
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut blob = encode(&sample());
        blob.push(0);
        assert!(matches!(
            decode(&blob),
            Err(Error::ManifestMalformed { .. })
        ));
    }

    #[test]
    fn id_gap_fails() {
        let mut blob = encode(&sample());
        // Corrupt the first record's id (bytes 4..8)
        blob[4] = 7;
        assert!(matches!(
            decode(&blob),
            Err(Error::ManifestMalformed { .. })
        ));
    }

    #[test]
    fn zero_path_len_fails() {
        // count=1, id=0, size=0, pathLen=0
        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&0u64.to_le_bytes());
        blob.extend_from_slice(&0u16.to_le_bytes());
        assert!(matches!(
            decode(&blob),
            Err(Error::ManifestMalformed { .. })
        ));
    }

    #[test]
    fn traversal_paths_rejected() {
        for path in [
            "../etc/passwd",
            "a/../b",
            "/etc/passwd",
            "C:evil",
            "c:/evil",
            "a//b",
            "a/./b",
            "a\\b",
            "nul\0byte",
            ".",
            "..",
        ] {
            assert!(
                matches!(check_path(path), Err(Error::PathUnsafe { .. })),
                "{path:?} must be rejected"
            );
        }
    }

    #[test]
    fn ordinary_paths_accepted() {
        for path in ["a.txt", "dir/sub/file.bin", "weird name.txt", "..a/b..c"] {
            assert!(check_path(path).is_ok(), "{path:?} must be accepted");
        }
    }

    #[test]
    fn unsafe_path_in_blob_rejected() {
        // Hand-build a blob whose single record escapes the root
        let path = b"../../x";
        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&9u64.to_le_bytes());
        blob.extend_from_slice(&(path.len() as u16).to_le_bytes());
        blob.extend_from_slice(path);
        assert!(matches!(decode(&blob), Err(Error::PathUnsafe { .. })));
    }
}
