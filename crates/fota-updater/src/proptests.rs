//! Property-based tests for fota-updater.
//!
//! # Properties Tested
//!
//! - Version ordering is a total order consistent with the rendered triple
//! - Malformed version strings parse to 0.0.0
//! - Manifest entries of another firmware type are never eligible
//! - Scheme inference from the port number
//! - Inflator output is independent of input and output chunk boundaries

#![cfg(test)]

use std::cmp::Ordering;
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use proptest::prelude::*;
use serde_json::json;

use crate::inflate::{InflateStatus, Inflator, DICT_SIZE};
use crate::manifest::{EntryOutcome, ManifestEvaluator, Scheme, SECURE_PORTS};
use crate::version::FirmwareVersion;

// =============================================================================
// Generators
// =============================================================================

fn arb_version() -> impl Strategy<Value = FirmwareVersion> {
    (0u64..50, 0u64..50, 0u64..50)
        .prop_map(|(major, minor, patch)| FirmwareVersion::new(major, minor, patch))
}

/// Payloads that mix repetitive runs with noise, so matches reach back
/// across the dictionary.
fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec((any::<u8>(), 1usize..300), 1..120).prop_map(|runs| {
        let mut out = Vec::new();
        for (i, (byte, len)) in runs.into_iter().enumerate() {
            if i % 3 == 0 {
                out.extend((0..len).map(|j| byte.wrapping_add(j as u8)));
            } else {
                out.extend(std::iter::repeat(byte).take(len));
            }
        }
        out
    })
}

// =============================================================================
// Helper Functions
// =============================================================================

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Inflate `compressed` fed in `step`-sized blocks; the consumer takes at
/// most `max_take` bytes per call.
fn inflate_in_steps(compressed: &[u8], step: usize, chunk_size: usize, max_take: usize) -> Vec<u8> {
    let mut inflator = Inflator::new();
    assert!(inflator.init());
    let mut out = Vec::new();
    let blocks: Vec<&[u8]> = compressed.chunks(step).collect();

    for (i, block) in blocks.iter().enumerate() {
        let is_final = i + 1 == blocks.len();
        let status = inflator
            .inflate_block(
                block,
                is_final,
                chunk_size,
                |chunk| {
                    let take = chunk.data.len().min(max_take);
                    out.extend_from_slice(&chunk.data[..take]);
                    take
                },
                || {},
            )
            .unwrap();
        if is_final {
            assert_eq!(status, InflateStatus::StreamEnd);
        }
    }
    inflator.end();
    out
}

// =============================================================================
// Version ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_compare_is_antisymmetric(a in arb_version(), b in arb_version()) {
        let forward = FirmwareVersion::compare(&a, &b);
        let backward = FirmwareVersion::compare(&b, &a);
        prop_assert_eq!(forward, backward.reverse());
        prop_assert_eq!(FirmwareVersion::compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn prop_parse_display_agrees(v in arb_version()) {
        prop_assert_eq!(FirmwareVersion::parse(&v.to_string()), v);
    }

    #[test]
    fn prop_patch_bump_is_newer(v in arb_version()) {
        let next = FirmwareVersion::new(v.major, v.minor, v.patch + 1);
        prop_assert!(next.is_newer_than(&v));
        prop_assert!(!v.is_newer_than(&next));
    }

    #[test]
    fn prop_malformed_parses_to_zero(text in "[a-uw-z .-]{1,12}") {
        prop_assert_eq!(FirmwareVersion::parse(&text), FirmwareVersion::ZERO);
    }
}

// =============================================================================
// Manifest evaluation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_type_gate(
        running in "[a-z]{3,8}",
        offered in "[a-z]{3,8}",
        version in arb_version(),
    ) {
        prop_assume!(running != offered);
        let evaluator = ManifestEvaluator::new(running, FirmwareVersion::ZERO);
        let entry = json!({
            "type": offered,
            "version": version.to_string(),
            "url": "http://h/fw.bin",
        });
        prop_assert_eq!(evaluator.evaluate_entry(&entry), EntryOutcome::TypeMismatch);
    }

    #[test]
    fn prop_scheme_from_port(port in any::<u16>()) {
        let scheme = Scheme::for_port(port);
        prop_assert_eq!(scheme.is_secure(), SECURE_PORTS.contains(&port));
    }
}

// =============================================================================
// Inflator chunk-boundary independence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_inflate_any_input_steps(
        data in arb_payload(),
        step in 1usize..700,
        chunk_size in 1usize..=DICT_SIZE,
    ) {
        let compressed = zlib(&data);
        let out = inflate_in_steps(&compressed, step, chunk_size, usize::MAX);
        prop_assert_eq!(out, data);
    }

    #[test]
    fn prop_inflate_partial_consumer(
        data in arb_payload(),
        step in 16usize..4096,
        max_take in 1usize..2048,
    ) {
        let compressed = zlib(&data);
        let out = inflate_in_steps(&compressed, step, 4096, max_take);
        prop_assert_eq!(out.len(), data.len());
        prop_assert_eq!(out, data);
    }
}
