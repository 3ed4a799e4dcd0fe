// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Key derivation functions for passphrase-based keyslots.
//!
//! Provides PBKDF2-HMAC over the header's hash for deriving keyslot KEKs and
//! the volume key digest, plus wall-clock calibration of the iteration count.

use super::registry::HashAlgorithm;
use super::KeyDerivation;
use crate::config::{KdfConfig, LUKS_SALTSIZE, MIN_ITERATIONS};
use crate::error::{LuksError, Result};

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Calibration stops doubling once a single run takes this long and
/// extrapolates linearly from there.
const BENCH_WINDOW: Duration = Duration::from_millis(50);

/// Cap on doubling steps so a broken clock cannot loop forever.
const MAX_BENCH_ROUNDS: u32 = 24;

/// PBKDF2 key derivation bound to one hash function.
#[derive(Debug, Clone, Copy)]
pub struct Pbkdf2Kdf {
    hash: HashAlgorithm,
}

impl Pbkdf2Kdf {
    /// Creates a PBKDF2 instance using HMAC over `hash`.
    pub fn new(hash: HashAlgorithm) -> Self {
        Self { hash }
    }

    /// Returns the underlying hash.
    pub fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    /// Resolves the iteration count for a target under `config`.
    ///
    /// A fixed count in the config skips benchmarking entirely.
    pub fn iterations_for(&self, config: &KdfConfig, target_ms: u64, out_len: usize) -> Result<u32> {
        match config.fixed_iterations {
            Some(fixed) => Ok(fixed.max(MIN_ITERATIONS)),
            None => self.calibrate_iterations(target_ms, out_len),
        }
    }
}

impl KeyDerivation for Pbkdf2Kdf {
    fn derive_key(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: u32,
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if iterations == 0 {
            return Err(LuksError::InvalidParameter("PBKDF2 iteration count is zero".into()));
        }
        if out_len == 0 {
            return Err(LuksError::InvalidParameter("PBKDF2 output length is zero".into()));
        }
        let mut key = Zeroizing::new(vec![0u8; out_len]);
        self.hash.pbkdf2(passphrase, salt, iterations, &mut key);
        Ok(key)
    }

    /// Doubles the iteration count until one run fills the benchmark window,
    /// then scales the measured rate to `target_ms`.
    fn calibrate_iterations(&self, target_ms: u64, out_len: usize) -> Result<u32> {
        let salt = [0u8; LUKS_SALTSIZE];
        let mut iterations = MIN_ITERATIONS;
        let mut elapsed = Duration::ZERO;

        for _ in 0..MAX_BENCH_ROUNDS {
            let start = Instant::now();
            self.derive_key(b"calibration", &salt, iterations, out_len)?;
            elapsed = start.elapsed();
            if elapsed >= BENCH_WINDOW || elapsed.as_millis() >= u128::from(target_ms) {
                break;
            }
            iterations = iterations.saturating_mul(2);
        }

        let elapsed_us = elapsed.as_micros().max(1);
        let scaled = u128::from(iterations) * u128::from(target_ms) * 1000 / elapsed_us;
        let result = u32::try_from(scaled).unwrap_or(u32::MAX).max(MIN_ITERATIONS);

        tracing::debug!(
            hash = self.hash.name(),
            target_ms,
            sample_iterations = iterations,
            sample_us = elapsed_us as u64,
            result,
            "calibrated PBKDF2"
        );
        Ok(result)
    }
}

/// Fills a fresh LUKS salt from the OS entropy source.
pub fn generate_salt() -> Result<[u8; LUKS_SALTSIZE]> {
    let mut salt = [0u8; LUKS_SALTSIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| LuksError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let kdf = Pbkdf2Kdf::new(HashAlgorithm::Sha256);
        let key1 = kdf.derive_key(b"test_password", b"salt", 1000, 32).unwrap();
        let key2 = kdf.derive_key(b"test_password", b"salt", 1000, 32).unwrap();
        assert_eq!(*key1, *key2, "Same password and salt should produce same key");
    }

    #[test]
    fn test_different_iterations_different_keys() {
        let kdf = Pbkdf2Kdf::new(HashAlgorithm::Sha256);
        let key1 = kdf.derive_key(b"pw", b"salt", 1000, 32).unwrap();
        let key2 = kdf.derive_key(b"pw", b"salt", 1001, 32).unwrap();
        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_pbkdf2_sha256_known_answer() {
        let kdf = Pbkdf2Kdf::new(HashAlgorithm::Sha256);
        let key = kdf.derive_key(b"password", b"salt", 1, 32).unwrap();
        assert_eq!(
            hex::encode(&*key),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let kdf = Pbkdf2Kdf::new(HashAlgorithm::Sha1);
        assert!(matches!(
            kdf.derive_key(b"pw", b"salt", 0, 20),
            Err(LuksError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_calibration_floor() {
        let kdf = Pbkdf2Kdf::new(HashAlgorithm::Sha256);
        let iterations = kdf.calibrate_iterations(1, 32).unwrap();
        assert!(iterations >= MIN_ITERATIONS);
    }

    #[test]
    fn test_fixed_config_skips_calibration() {
        let kdf = Pbkdf2Kdf::new(HashAlgorithm::Sha256);
        let iterations = kdf.iterations_for(&KdfConfig::fixed(4242), 10_000, 32).unwrap();
        assert_eq!(iterations, 4242);
    }

    #[test]
    fn test_generate_salt() {
        let salt1 = generate_salt().unwrap();
        let salt2 = generate_salt().unwrap();
        assert_ne!(salt1, salt2, "Generated salts should be unique");
    }
}
