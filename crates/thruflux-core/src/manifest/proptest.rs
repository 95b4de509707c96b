//! Property-based tests for the manifest codec.
//!
//! These tests use proptest to verify:
//! - Encoding determinism and fingerprint stability for arbitrary input sets
//! - Codec roundtrip for arbitrary manifests
//! - Rejection of generated traversal paths, at the path check and through
//!   a full decode
//! - The decoder never panics on arbitrary bytes

#![cfg(test)]

use proptest::prelude::*;

use crate::error::Error;
use crate::manifest::{codec, Manifest};

// =============================================================================
// Arbitrary Generators
// =============================================================================

/// A single safe path component: no separators, no dots.
fn arb_component() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,8}"
}

/// A forward-slash relative path that passes `check_path`.
fn arb_safe_path() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_component(), 1..4).prop_map(|parts| parts.join("/"))
}

/// An input listing with unique paths and arbitrary sizes, including zero.
fn arb_listing() -> impl Strategy<Value = Vec<(String, u64)>> {
    prop::collection::btree_map(arb_safe_path(), 0u64..=1 << 20, 0..16)
        .prop_map(|map| map.into_iter().collect())
}

/// A path carrying exactly one of the forbidden shapes: traversal
/// component, absolute prefix, drive letter, NUL, backslash, or an
/// empty/dot component.
fn arb_unsafe_path() -> impl Strategy<Value = String> {
    prop_oneof![
        arb_safe_path().prop_map(|p| format!("../{p}")),
        (arb_safe_path(), arb_safe_path()).prop_map(|(a, b)| format!("{a}/../{b}")),
        arb_safe_path().prop_map(|p| format!("{p}/..")),
        arb_safe_path().prop_map(|p| format!("/{p}")),
        (prop::char::range('a', 'z'), arb_safe_path())
            .prop_map(|(drive, p)| format!("{drive}:{p}")),
        (arb_safe_path(), arb_safe_path()).prop_map(|(a, b)| format!("{a}\0{b}")),
        (arb_safe_path(), arb_safe_path()).prop_map(|(a, b)| format!("{a}\\{b}")),
        (arb_safe_path(), arb_safe_path()).prop_map(|(a, b)| format!("{a}//{b}")),
        (arb_safe_path(), arb_safe_path()).prop_map(|(a, b)| format!("{a}/./{b}")),
    ]
}

/// One-record manifest blob carrying the given path verbatim.
fn single_record_blob(path: &str, size: u64) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(&size.to_le_bytes());
    blob.extend_from_slice(&(path.len() as u16).to_le_bytes());
    blob.extend_from_slice(path.as_bytes());
    blob
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #[test]
    fn encoding_is_deterministic_for_any_input_set(listing in arb_listing()) {
        let mut reversed = listing.clone();
        reversed.reverse();

        // Same input set in any order encodes to identical bytes
        let a = codec::encode(&Manifest::from_listing(listing).unwrap());
        let b = codec::encode(&Manifest::from_listing(reversed).unwrap());
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(codec::fingerprint(&a), codec::fingerprint(&b));
    }

    #[test]
    fn roundtrip_arbitrary_manifest(listing in arb_listing()) {
        let manifest = Manifest::from_listing(listing).unwrap();
        let decoded = codec::decode(&codec::encode(&manifest)).unwrap();
        prop_assert_eq!(decoded, manifest);
    }

    #[test]
    fn ids_are_dense_and_follow_path_order(listing in arb_listing()) {
        let manifest = Manifest::from_listing(listing).unwrap();
        let files = manifest.files();
        for (i, file) in files.iter().enumerate() {
            prop_assert_eq!(file.id as usize, i);
            if i > 0 {
                prop_assert!(files[i - 1].relative_path < file.relative_path);
            }
        }
    }

    #[test]
    fn generated_traversal_paths_are_rejected(path in arb_unsafe_path(), size in 0u64..=1 << 20) {
        prop_assert!(
            matches!(codec::check_path(&path), Err(Error::PathUnsafe { .. })),
            "expected PathUnsafe error"
        );

        // The same path smuggled into a well-formed record fails a full
        // decode too
        let blob = single_record_blob(&path, size);
        prop_assert!(codec::decode(&blob).is_err());
    }

    #[test]
    fn generated_safe_paths_are_accepted(path in arb_safe_path()) {
        prop_assert!(codec::check_path(&path).is_ok());
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        // May succeed or fail, must not panic
        let _ = codec::decode(&data);
    }

    #[test]
    fn decode_never_panics_on_corrupted_valid_blob(
        listing in arb_listing(),
        flip in any::<(usize, u8)>(),
    ) {
        let mut blob = codec::encode(&Manifest::from_listing(listing).unwrap());
        if !blob.is_empty() {
            let (pos, xor) = flip;
            let idx = pos % blob.len();
            blob[idx] ^= xor;
        }
        let _ = codec::decode(&blob);
    }
}
