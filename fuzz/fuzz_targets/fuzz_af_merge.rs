// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Fuzzing target for anti-forensic merge
//!
//! Merges arbitrary material with an arbitrary stripe count and hash.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use luks1_vault::crypto::af;
use luks1_vault::HashAlgorithm;

#[derive(Debug, Arbitrary)]
struct Input {
    stripes: u8,
    sha1: bool,
    material: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let hash = if input.sha1 {
        HashAlgorithm::Sha1
    } else {
        HashAlgorithm::Sha256
    };
    if let Ok(key) = af::merge(&input.material, u32::from(input.stripes), hash) {
        assert_eq!(key.len() * usize::from(input.stripes), input.material.len());
    }
});
