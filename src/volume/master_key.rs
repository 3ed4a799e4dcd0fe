// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Volume key held by an open device context.

use crate::config::{LUKS_DIGESTSIZE, MAX_VOLUME_KEY_SIZE};
use crate::crypto::registry::HashAlgorithm;
use crate::error::{LuksError, Result};

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Volume key used for payload encryption (securely zeroized on drop)
#[derive(Clone)]
pub struct MasterKey {
    key: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    /// Generates a new random volume key of `len` bytes.
    pub fn generate(len: usize) -> Result<Self> {
        check_len(len)?;
        let mut key = Zeroizing::new(vec![0u8; len]);
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| LuksError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Self { key })
    }

    /// Creates a volume key from caller-supplied bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes.len())?;
        Ok(Self {
            key: Zeroizing::new(bytes.to_vec()),
        })
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// Always false; keys are never empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// PBKDF2 digest stored in the header for O(1) verification.
    pub fn digest(&self, hash: HashAlgorithm, salt: &[u8], iterations: u32) -> Result<[u8; LUKS_DIGESTSIZE]> {
        if iterations == 0 {
            return Err(LuksError::InvalidParameter("digest iteration count is zero".into()));
        }
        let mut out = [0u8; LUKS_DIGESTSIZE];
        hash.pbkdf2(&self.key, salt, iterations, &mut out);
        Ok(out)
    }

    /// Compares this key's digest with `expected` in constant time.
    pub fn matches_digest(
        &self,
        hash: HashAlgorithm,
        salt: &[u8],
        iterations: u32,
        expected: &[u8; LUKS_DIGESTSIZE],
    ) -> Result<bool> {
        let actual = Zeroizing::new(self.digest(hash, salt, iterations)?);
        Ok(bool::from(actual.as_slice().ct_eq(expected.as_slice())))
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_VOLUME_KEY_SIZE {
        return Err(LuksError::InvalidParameter(format!(
            "volume key size {} out of range (1..={})",
            len, MAX_VOLUME_KEY_SIZE
        )));
    }
    Ok(())
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("len", &self.key.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_generation() {
        let key1 = MasterKey::generate(64).unwrap();
        let key2 = MasterKey::generate(64).unwrap();
        assert_eq!(key1.len(), 64);
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_key_size_bounds() {
        assert!(MasterKey::generate(0).is_err());
        assert!(MasterKey::from_bytes(&[0u8; 129]).is_err());
        assert!(MasterKey::from_bytes(&[0u8; 128]).is_ok());
    }

    #[test]
    fn test_digest_matches() {
        let key = MasterKey::from_bytes(&[0x42; 32]).unwrap();
        let salt = [1u8; 32];
        let digest = key.digest(HashAlgorithm::Sha256, &salt, 1000).unwrap();
        assert!(key.matches_digest(HashAlgorithm::Sha256, &salt, 1000, &digest).unwrap());

        let other = MasterKey::from_bytes(&[0x43; 32]).unwrap();
        assert!(!other.matches_digest(HashAlgorithm::Sha256, &salt, 1000, &digest).unwrap());
        assert!(!key.matches_digest(HashAlgorithm::Sha256, &salt, 1001, &digest).unwrap());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = MasterKey::from_bytes(&[0xab; 16]).unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }
}
