// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Fuzzing target for loading a device image
//!
//! Places arbitrary bytes at the start of a small in-memory device and runs
//! the full load path, including staged-commit recovery.

#![no_main]

use libfuzzer_sys::fuzz_target;
use luks1_vault::{Backends, CryptDevice, KdfConfig, MemoryDevice, MemoryMapper};
use std::sync::Arc;

const DEVICE_SIZE: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    let mut image = vec![0u8; DEVICE_SIZE];
    let n = data.len().min(DEVICE_SIZE);
    image[..n].copy_from_slice(&data[..n]);

    let backends = Backends::with_mapper(Arc::new(MemoryMapper::new())).kdf(KdfConfig::fast());
    let mut device = CryptDevice::init_with_device(Box::new(MemoryDevice::from_image(image)), backends);
    if device.load(None).is_ok() {
        let _ = device.dump();
        for slot in 0..8 {
            let _ = device.keyslot_status(slot);
        }
    }
});
