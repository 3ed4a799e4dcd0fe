// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Configuration management for LUKS1 volumes.
//!
//! This module defines the fixed on-disk constants of the LUKS1 format and
//! the tunable key-derivation cost used when creating keyslots.

/// Magic bytes identifying a LUKS partition header.
pub const LUKS_MAGIC: [u8; 6] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];

/// The only header version this engine reads or writes.
pub const LUKS_VERSION: u16 = 1;

/// Format identifier returned by `CryptDevice::device_type`.
pub const LUKS1_TYPE: &str = "LUKS1";

/// Number of keyslots in a LUKS1 header.
pub const LUKS_NUMKEYS: usize = 8;

/// Sector size used for offsets and keyslot material IVs.
pub const SECTOR_SIZE: usize = 512;

/// Anti-forensic stripes per keyslot.
pub const LUKS_STRIPES: u32 = 4000;

/// Salt length for keyslots and the volume key digest.
pub const LUKS_SALTSIZE: usize = 32;

/// Stored volume key digest length.
pub const LUKS_DIGESTSIZE: usize = 20;

/// Keyslot material areas are aligned to 4 KiB.
pub const LUKS_ALIGN_KEYSLOTS: u64 = 4096;

/// Default payload alignment in sectors (1 MiB).
pub const DEFAULT_DATA_ALIGNMENT: u64 = 2048;

/// Lower bound on PBKDF2 iterations for keyslots and the digest.
pub const MIN_ITERATIONS: u32 = 1000;

/// Default keyslot unlock cost in milliseconds.
pub const DEFAULT_ITERATION_TIME_MS: u64 = 2000;

/// Default volume key digest cost in milliseconds.
pub const DEFAULT_DIGEST_TIME_MS: u64 = 125;

/// Largest volume key the header can describe.
pub const MAX_VOLUME_KEY_SIZE: usize = 128;

/// Configuration for PBKDF2 cost at format and keyslot-creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfConfig {
    /// Wall-clock target for one keyslot unlock.
    pub iteration_time_ms: u64,
    /// Wall-clock target for one volume key digest check.
    pub digest_time_ms: u64,
    /// Skip calibration and use this iteration count everywhere.
    pub fixed_iterations: Option<u32>,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iteration_time_ms: DEFAULT_ITERATION_TIME_MS,
            digest_time_ms: DEFAULT_DIGEST_TIME_MS,
            fixed_iterations: None,
        }
    }
}

impl KdfConfig {
    /// Creates a calibrated configuration with custom time targets.
    ///
    /// Zero targets are clamped to 1 ms.
    pub fn new(iteration_time_ms: u64, digest_time_ms: u64) -> Self {
        Self {
            iteration_time_ms: iteration_time_ms.max(1),
            digest_time_ms: digest_time_ms.max(1),
            fixed_iterations: None,
        }
    }

    /// Uses a fixed iteration count instead of benchmarking.
    ///
    /// Counts below [`MIN_ITERATIONS`] are clamped.
    pub fn fixed(iterations: u32) -> Self {
        Self {
            fixed_iterations: Some(iterations.max(MIN_ITERATIONS)),
            ..Self::default()
        }
    }

    /// Minimum-cost configuration.
    ///
    /// # ⚠️ Security Warning
    ///
    /// Only for tests and throwaway images. Keyslots created with this
    /// preset are cheap to brute force.
    #[doc(alias = "test")]
    pub fn fast() -> Self {
        Self::fixed(MIN_ITERATIONS)
    }

    /// Four times the default unlock cost.
    pub fn paranoid() -> Self {
        Self::new(DEFAULT_ITERATION_TIME_MS * 4, DEFAULT_DIGEST_TIME_MS * 4)
    }
}
