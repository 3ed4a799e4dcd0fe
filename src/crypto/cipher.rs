// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! AES sector ciphers for keyslot material.
//!
//! LUKS1 encrypts each keyslot's split key material with the volume's own
//! cipher specification, keyed by the passphrase-derived KEK, with sector
//! IVs counted from the start of the keyslot area.

use super::registry::HashAlgorithm;
use super::SectorCipher;
use crate::config::SECTOR_SIZE;
use crate::error::{LuksError, Result};

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

const BLOCK_SIZE: usize = 16;

/// Supported `mode` strings of a LUKS1 cipher specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// XTS with a 32-bit little-endian sector tweak.
    XtsPlain,
    /// XTS with a 64-bit little-endian sector tweak.
    XtsPlain64,
    /// CBC with a 32-bit sector IV.
    CbcPlain,
    /// CBC with a 64-bit sector IV.
    CbcPlain64,
    /// CBC with encrypted salt-sector IV, salt = hash(key).
    CbcEssiv(HashAlgorithm),
}

impl CipherMode {
    /// Parses a mode string such as `xts-plain64` or `cbc-essiv:sha256`.
    pub fn parse(mode: &str) -> Result<Self> {
        let lowered = mode.to_ascii_lowercase();
        match lowered.as_str() {
            "xts-plain" => Ok(Self::XtsPlain),
            "xts-plain64" => Ok(Self::XtsPlain64),
            "cbc-plain" => Ok(Self::CbcPlain),
            "cbc-plain64" => Ok(Self::CbcPlain64),
            other => match other.strip_prefix("cbc-essiv:") {
                // ESSIV needs a hash whose output is an AES key length
                Some("sha256") => Ok(Self::CbcEssiv(HashAlgorithm::Sha256)),
                _ => Err(LuksError::UnsupportedPrimitive(format!("cipher mode {}", mode))),
            },
        }
    }

    /// Mode string as written into headers.
    pub fn name(&self) -> String {
        match self {
            Self::XtsPlain => "xts-plain".to_string(),
            Self::XtsPlain64 => "xts-plain64".to_string(),
            Self::CbcPlain => "cbc-plain".to_string(),
            Self::CbcPlain64 => "cbc-plain64".to_string(),
            Self::CbcEssiv(hash) => format!("cbc-essiv:{}", hash.name()),
        }
    }

    /// Whether AES in this mode takes a key of `key_size` bytes.
    pub fn accepts_key_size(&self, key_size: usize) -> bool {
        match self {
            Self::XtsPlain | Self::XtsPlain64 => matches!(key_size, 32 | 48 | 64),
            Self::CbcPlain | Self::CbcPlain64 | Self::CbcEssiv(_) => {
                matches!(key_size, 16 | 24 | 32)
            }
        }
    }
}

/// AES block cipher of any standard key length.
enum AesBlock {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesBlock {
    fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| LuksError::InvalidParameter(format!("invalid AES key length {}", key.len()));
        match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128).map_err(invalid),
            24 => Aes192::new_from_slice(key).map(Self::Aes192).map_err(invalid),
            32 => Aes256::new_from_slice(key).map(Self::Aes256).map_err(invalid),
            n => Err(LuksError::InvalidParameter(format!("invalid AES key length {}", n))),
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block(block),
            Self::Aes192(c) => c.decrypt_block(block),
            Self::Aes256(c) => c.decrypt_block(block),
        }
    }
}

enum XtsEngine {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

impl XtsEngine {
    fn new(key: &[u8]) -> Result<Self> {
        let (k1, k2) = key.split_at(key.len() / 2);
        let invalid = |_| LuksError::InvalidParameter(format!("invalid XTS key length {}", key.len()));
        Ok(match key.len() {
            32 => Self::Aes128(Xts128::new(
                Aes128::new_from_slice(k1).map_err(invalid)?,
                Aes128::new_from_slice(k2).map_err(invalid)?,
            )),
            48 => Self::Aes192(Xts128::new(
                Aes192::new_from_slice(k1).map_err(invalid)?,
                Aes192::new_from_slice(k2).map_err(invalid)?,
            )),
            64 => Self::Aes256(Xts128::new(
                Aes256::new_from_slice(k1).map_err(invalid)?,
                Aes256::new_from_slice(k2).map_err(invalid)?,
            )),
            n => return Err(LuksError::InvalidParameter(format!("invalid XTS key length {}", n))),
        })
    }

    fn apply(&self, data: &mut [u8], first_sector: u64, wide: bool, encrypt: bool) {
        let tweak = move |sector: u128| {
            if wide {
                get_tweak_default(sector & u128::from(u64::MAX))
            } else {
                get_tweak_default(sector & u128::from(u32::MAX))
            }
        };
        let first = u128::from(first_sector);
        match (self, encrypt) {
            (Self::Aes128(x), true) => x.encrypt_area(data, SECTOR_SIZE, first, tweak),
            (Self::Aes128(x), false) => x.decrypt_area(data, SECTOR_SIZE, first, tweak),
            (Self::Aes192(x), true) => x.encrypt_area(data, SECTOR_SIZE, first, tweak),
            (Self::Aes192(x), false) => x.decrypt_area(data, SECTOR_SIZE, first, tweak),
            (Self::Aes256(x), true) => x.encrypt_area(data, SECTOR_SIZE, first, tweak),
            (Self::Aes256(x), false) => x.decrypt_area(data, SECTOR_SIZE, first, tweak),
        }
    }
}

enum Engine {
    Xts { xts: XtsEngine, wide: bool },
    Cbc { block: AesBlock, iv: CbcIv },
}

enum CbcIv {
    Plain,
    Plain64,
    Essiv(AesBlock),
}

impl CbcIv {
    fn for_sector(&self, sector: u64) -> [u8; BLOCK_SIZE] {
        let mut iv = [0u8; BLOCK_SIZE];
        match self {
            Self::Plain => iv[..4].copy_from_slice(&(sector as u32).to_le_bytes()),
            Self::Plain64 => iv[..8].copy_from_slice(&sector.to_le_bytes()),
            Self::Essiv(salt_cipher) => {
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                salt_cipher.encrypt_block(&mut iv);
            }
        }
        iv
    }
}

/// AES in one of the [`CipherMode`]s, keyed once and reused per sector.
pub struct AesSectorCipher {
    engine: Engine,
}

impl AesSectorCipher {
    /// Keys AES for `mode`. Fails if the key length does not fit the mode.
    pub fn new(mode: CipherMode, key: &[u8]) -> Result<Self> {
        if !mode.accepts_key_size(key.len()) {
            return Err(LuksError::InvalidParameter(format!(
                "aes-{} does not accept a {}-byte key",
                mode.name(),
                key.len()
            )));
        }
        let engine = match mode {
            CipherMode::XtsPlain => Engine::Xts { xts: XtsEngine::new(key)?, wide: false },
            CipherMode::XtsPlain64 => Engine::Xts { xts: XtsEngine::new(key)?, wide: true },
            CipherMode::CbcPlain => Engine::Cbc { block: AesBlock::new(key)?, iv: CbcIv::Plain },
            CipherMode::CbcPlain64 => Engine::Cbc {
                block: AesBlock::new(key)?,
                iv: CbcIv::Plain64,
            },
            CipherMode::CbcEssiv(hash) => {
                let salt = Zeroizing::new(hash.digest(&[key]));
                Engine::Cbc {
                    block: AesBlock::new(key)?,
                    iv: CbcIv::Essiv(AesBlock::new(&salt)?),
                }
            }
        };
        Ok(Self { engine })
    }

    fn check_len(data: &[u8]) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(LuksError::InvalidParameter(format!(
                "buffer length {} is not a multiple of the sector size",
                data.len()
            )));
        }
        Ok(())
    }
}

impl SectorCipher for AesSectorCipher {
    fn encrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        Self::check_len(data)?;
        match &self.engine {
            Engine::Xts { xts, wide } => xts.apply(data, first_sector, *wide, true),
            Engine::Cbc { block, iv } => {
                for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                    let mut prev = iv.for_sector(first_sector + i as u64);
                    for chunk in sector.chunks_exact_mut(BLOCK_SIZE) {
                        chunk.iter_mut().zip(prev.iter()).for_each(|(b, p)| *b ^= p);
                        block.encrypt_block(chunk);
                        prev.copy_from_slice(chunk);
                    }
                }
            }
        }
        Ok(())
    }

    fn decrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        Self::check_len(data)?;
        match &self.engine {
            Engine::Xts { xts, wide } => xts.apply(data, first_sector, *wide, false),
            Engine::Cbc { block, iv } => {
                for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                    let mut prev = iv.for_sector(first_sector + i as u64);
                    for chunk in sector.chunks_exact_mut(BLOCK_SIZE) {
                        let mut saved = [0u8; BLOCK_SIZE];
                        saved.copy_from_slice(chunk);
                        block.decrypt_block(chunk);
                        chunk.iter_mut().zip(prev.iter()).for_each(|(b, p)| *b ^= p);
                        prev = saved;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(mode: CipherMode, key_len: usize) {
        let key: Vec<u8> = (0..key_len as u8).collect();
        let cipher = AesSectorCipher::new(mode, &key).unwrap();
        let plaintext: Vec<u8> = (0..SECTOR_SIZE * 3).map(|i| (i % 251) as u8).collect();

        let mut data = plaintext.clone();
        cipher.encrypt_sectors(&mut data, 7).unwrap();
        assert_ne!(data, plaintext);

        cipher.decrypt_sectors(&mut data, 7).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_all_modes_roundtrip() {
        roundtrip(CipherMode::XtsPlain64, 64);
        roundtrip(CipherMode::XtsPlain64, 32);
        roundtrip(CipherMode::XtsPlain, 48);
        roundtrip(CipherMode::CbcPlain, 16);
        roundtrip(CipherMode::CbcPlain64, 24);
        roundtrip(CipherMode::CbcEssiv(HashAlgorithm::Sha256), 32);
    }

    #[test]
    fn test_sector_index_changes_ciphertext() {
        let cipher = AesSectorCipher::new(CipherMode::XtsPlain64, &[9u8; 64]).unwrap();
        let mut a = vec![0u8; SECTOR_SIZE];
        let mut b = vec![0u8; SECTOR_SIZE];
        cipher.encrypt_sectors(&mut a, 0).unwrap();
        cipher.encrypt_sectors(&mut b, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cbc_identical_sectors_differ() {
        let cipher = AesSectorCipher::new(CipherMode::CbcPlain64, &[3u8; 32]).unwrap();
        let mut data = vec![0u8; SECTOR_SIZE * 2];
        cipher.encrypt_sectors(&mut data, 0).unwrap();
        assert_ne!(data[..SECTOR_SIZE], data[SECTOR_SIZE..]);
    }

    #[test]
    fn test_partial_sector_rejected() {
        let cipher = AesSectorCipher::new(CipherMode::XtsPlain64, &[1u8; 64]).unwrap();
        let mut data = vec![0u8; 100];
        assert!(cipher.encrypt_sectors(&mut data, 0).is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(CipherMode::parse("XTS-PLAIN64").unwrap(), CipherMode::XtsPlain64);
        assert_eq!(
            CipherMode::parse("cbc-essiv:sha256").unwrap().name(),
            "cbc-essiv:sha256"
        );
        assert!(CipherMode::parse("cbc-essiv:sha1").is_err());
        assert!(CipherMode::parse("ecb").is_err());
    }
}
