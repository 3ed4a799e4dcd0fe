// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Cryptographic operations for keyslot wrapping and key derivation.
//!
//! This module provides trait-based abstractions over the primitives a LUKS1
//! header names by string (cipher, mode, hash), so the volume layer can be
//! driven by any registry that resolves those names.

pub mod af;
pub mod cipher;
pub mod kdf;
pub mod registry;

use crate::error::Result;
use zeroize::Zeroizing;

/// Trait for sector-addressed symmetric encryption.
///
/// Implementors encrypt whole 512-byte sectors in place, deriving each
/// sector's IV or tweak from its index.
pub trait SectorCipher: Send + Sync {
    /// Encrypt `data` in place.
    ///
    /// # Arguments
    ///
    /// * `data` - Buffer whose length is a multiple of the sector size
    /// * `first_sector` - IV index of the first sector in `data`
    fn encrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<()>;

    /// Decrypt `data` in place. Same layout rules as `encrypt_sectors`.
    fn decrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<()>;
}

/// Trait for password-based key derivation.
///
/// Implementors derive key-encryption keys from passphrases with a caller
/// chosen cost, and can benchmark the cost needed for a wall-clock target.
pub trait KeyDerivation: Send + Sync {
    /// Derive `out_len` bytes from a passphrase and salt.
    ///
    /// Deterministic: equal inputs always produce equal output.
    fn derive_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: u32,
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Iteration count whose derivation takes roughly `target_ms`.
    fn calibrate_iterations(&self, target_ms: u64, out_len: usize) -> Result<u32>;
}
