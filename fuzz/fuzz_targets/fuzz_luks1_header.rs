// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Fuzzing target for LUKS1 phdr decoding
//!
//! Decodes arbitrary bytes as a header and, when decoding succeeds, runs
//! validation and re-encoding. Nothing here may panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use luks1_vault::volume::header::probe_version;
use luks1_vault::volume::{HeaderFormat, Luks1Header, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    let _ = probe_version(data);

    if let Ok(header) = Luks1Header::decode(data) {
        let _ = header.validate(u64::MAX);
        let _ = header.validate(16 * 1024 * 1024);
        let _ = header.first_free_slot();
        let _ = header.info();

        // A decoded header must encode back to the same bytes
        if let Ok(encoded) = header.encode() {
            assert_eq!(&encoded[..], &data[..HEADER_SIZE]);
        }
    }
});
