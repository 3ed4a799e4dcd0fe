// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Name-based lookup of the primitives a LUKS1 header refers to.
//!
//! Headers store the cipher (`"aes"`), mode (`"xts-plain64"`) and hash
//! (`"sha256"`) as strings. The [`PrimitiveRegistry`] trait turns those
//! names into usable algorithms; [`DefaultRegistry`] backs it with the
//! RustCrypto crates.

use super::cipher::{AesSectorCipher, CipherMode};
use super::SectorCipher;
use crate::error::{LuksError, Result};

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Hash functions usable for PBKDF2, AF diffusion and ESSIV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy LUKS1 default)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Resolves a header hash name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(LuksError::UnsupportedPrimitive(format!("hash {}", name))),
        }
    }

    /// Canonical name as written into headers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Output length in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => digest_parts::<Sha1>(parts),
            Self::Sha256 => digest_parts::<Sha256>(parts),
            Self::Sha512 => digest_parts::<Sha512>(parts),
        }
    }

    /// PBKDF2 with HMAC over this hash, filling `out`.
    pub fn pbkdf2(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        match self {
            Self::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, out),
            Self::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, out),
            Self::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, out),
        }
    }
}

fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Capability interface resolving primitive names.
///
/// Injected into a device context so tests and embedders can swap the
/// algorithm backend.
pub trait PrimitiveRegistry: Send + Sync {
    /// Resolves a hash name.
    fn hash(&self, name: &str) -> Result<HashAlgorithm>;

    /// Checks that `cipher`/`mode` exist and accept a key of `key_size` bytes.
    fn check_cipher(&self, cipher: &str, mode: &str, key_size: usize) -> Result<()>;

    /// Builds a keyed sector cipher.
    fn sector_cipher(&self, cipher: &str, mode: &str, key: &[u8]) -> Result<Box<dyn SectorCipher>>;
}

/// Registry backed by the `aes`, `xts-mode`, `sha1`, `sha2` and `pbkdf2` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRegistry;

impl DefaultRegistry {
    fn resolve_mode(&self, cipher: &str, mode: &str) -> Result<CipherMode> {
        if !cipher.eq_ignore_ascii_case("aes") {
            return Err(LuksError::UnsupportedPrimitive(format!("cipher {}", cipher)));
        }
        CipherMode::parse(mode)
    }
}

impl PrimitiveRegistry for DefaultRegistry {
    fn hash(&self, name: &str) -> Result<HashAlgorithm> {
        HashAlgorithm::from_name(name)
    }

    fn check_cipher(&self, cipher: &str, mode: &str, key_size: usize) -> Result<()> {
        let mode = self.resolve_mode(cipher, mode)?;
        if !mode.accepts_key_size(key_size) {
            return Err(LuksError::InvalidParameter(format!(
                "{}-{} does not accept a {}-bit key",
                cipher,
                mode.name(),
                key_size * 8
            )));
        }
        Ok(())
    }

    fn sector_cipher(&self, cipher: &str, mode: &str, key: &[u8]) -> Result<Box<dyn SectorCipher>> {
        let mode = self.resolve_mode(cipher, mode)?;
        Ok(Box::new(AesSectorCipher::new(mode, key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_names() {
        assert_eq!(HashAlgorithm::from_name("SHA256").unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::from_name("sha1").unwrap().digest_size(), 20);
        assert!(matches!(
            HashAlgorithm::from_name("whirlpool"),
            Err(LuksError::UnsupportedPrimitive(_))
        ));
    }

    #[test]
    fn test_sha256_known_answer() {
        let out = HashAlgorithm::Sha256.digest(&[b"ab", b"c"]);
        assert_eq!(
            hex::encode(out),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_pbkdf2_sha1_rfc6070() {
        let mut out = [0u8; 20];
        HashAlgorithm::Sha1.pbkdf2(b"password", b"salt", 2, &mut out);
        assert_eq!(hex::encode(out), "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957");
    }

    #[test]
    fn test_check_cipher() {
        let registry = DefaultRegistry;
        assert!(registry.check_cipher("aes", "xts-plain64", 64).is_ok());
        assert!(registry.check_cipher("aes", "cbc-essiv:sha256", 32).is_ok());
        assert!(matches!(
            registry.check_cipher("aes", "xts-plain64", 16),
            Err(LuksError::InvalidParameter(_))
        ));
        assert!(matches!(
            registry.check_cipher("serpent", "xts-plain64", 64),
            Err(LuksError::UnsupportedPrimitive(_))
        ));
        assert!(matches!(
            registry.check_cipher("aes", "ctr-plain", 32),
            Err(LuksError::UnsupportedPrimitive(_))
        ));
    }
}
