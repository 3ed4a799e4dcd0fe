// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! LUKS1 partition header (phdr).
//!
//! The header is a fixed 592-byte big-endian record at the start of the
//! device: cipher and hash names, payload offset, the volume key digest and
//! eight keyslot descriptors. Everything else on the device is keyslot
//! material or payload.

use crate::config::{
    LUKS1_TYPE, LUKS_ALIGN_KEYSLOTS, LUKS_DIGESTSIZE, LUKS_MAGIC, LUKS_NUMKEYS, LUKS_SALTSIZE,
    LUKS_STRIPES, LUKS_VERSION, MAX_VOLUME_KEY_SIZE, SECTOR_SIZE,
};
use crate::error::{LuksError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// Encoded size of a LUKS1 phdr.
pub const HEADER_SIZE: usize = 592;

/// Keyslot state word for an active slot.
pub const KEY_ENABLED: u32 = 0x00AC_71F3;

/// Keyslot state word for an inactive slot.
pub const KEY_DISABLED: u32 = 0x0000_DEAD;

const NAME_LEN: usize = 32;
const UUID_LEN: usize = 40;

/// First sector available to keyslot material.
pub const FIRST_KEYSLOT_SECTOR: u64 = LUKS_ALIGN_KEYSLOTS / SECTOR_SIZE as u64;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Number of sectors covered by `len` bytes.
pub fn sectors_for(len: u64) -> u64 {
    len.div_ceil(SECTOR_SIZE as u64)
}

fn round_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Sectors of stored material for one keyslot.
pub fn material_sectors(key_bytes: u32, stripes: u32) -> u64 {
    sectors_for(u64::from(key_bytes) * u64::from(stripes))
}

/// Per-slot material offsets and the payload offset for a new header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Starting sector of each keyslot's material.
    pub keyslot_offsets: [u32; LUKS_NUMKEYS],
    /// First payload sector.
    pub payload_offset: u32,
}

impl Layout {
    /// Packs eight 4 KiB-aligned material areas after the header and
    /// aligns the payload to `data_alignment` sectors.
    pub fn compute(key_bytes: u32, stripes: u32, data_alignment: u64) -> Result<Self> {
        let align = FIRST_KEYSLOT_SECTOR;
        let per_slot = round_up(material_sectors(key_bytes, stripes), align);
        let mut keyslot_offsets = [0u32; LUKS_NUMKEYS];
        let mut next = round_up(sectors_for(HEADER_SIZE as u64), align);
        for offset in keyslot_offsets.iter_mut() {
            *offset = u32::try_from(next)
                .map_err(|_| LuksError::InvalidParameter("keyslot area exceeds 32-bit sectors".into()))?;
            next += per_slot;
        }
        let payload = round_up(next, if data_alignment == 0 { align } else { data_alignment });
        let payload_offset = u32::try_from(payload)
            .map_err(|_| LuksError::InvalidParameter("payload offset exceeds 32-bit sectors".into()))?;
        Ok(Self {
            keyslot_offsets,
            payload_offset,
        })
    }
}

/// Behavior that varies by on-disk format version.
pub trait HeaderFormat: Sized {
    /// Format identifier reported to callers.
    const TYPE: &'static str;

    /// Encoded length in bytes.
    const ENCODED_LEN: usize;

    /// Parses and structurally checks a header. `bytes` must be exactly
    /// [`HeaderFormat::ENCODED_LEN`] long.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Encodes the header.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Material area of every slot as `(first_sector, sector_count)`.
    fn slot_layout(&self) -> Vec<(u64, u64)>;

    /// Hash name used for the digest, PBKDF2 and AF diffusion.
    fn digest_algorithm(&self) -> &str;
}

/// Returns the header version after checking the magic.
pub fn probe_version(bytes: &[u8]) -> Result<u16> {
    if bytes.len() < 8 || bytes[..6] != LUKS_MAGIC {
        return Err(LuksError::NotLuksHeader);
    }
    Ok(u16::from_be_bytes([bytes[6], bytes[7]]))
}

/// Keyslot descriptor as stored in the phdr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyslotRecord {
    active: u32,
    iterations: u32,
    salt: [u8; LUKS_SALTSIZE],
    key_material_offset: u32,
    stripes: u32,
}

impl KeyslotRecord {
    /// An inactive slot pointing at its material area.
    pub fn disabled(key_material_offset: u32, stripes: u32) -> Self {
        Self {
            active: KEY_DISABLED,
            iterations: 0,
            salt: [0u8; LUKS_SALTSIZE],
            key_material_offset,
            stripes,
        }
    }

    /// Marks the slot active with fresh KDF parameters.
    pub fn enable(&mut self, iterations: u32, salt: [u8; LUKS_SALTSIZE]) {
        self.active = KEY_ENABLED;
        self.iterations = iterations;
        self.salt = salt;
    }

    /// Marks the slot inactive and forgets its KDF parameters.
    pub fn disable(&mut self) {
        self.active = KEY_DISABLED;
        self.iterations = 0;
        self.salt = [0u8; LUKS_SALTSIZE];
    }

    /// Returns true if this slot holds a key.
    pub fn is_active(&self) -> bool {
        self.active == KEY_ENABLED
    }

    /// PBKDF2 iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// PBKDF2 salt.
    pub fn salt(&self) -> &[u8; LUKS_SALTSIZE] {
        &self.salt
    }

    /// First sector of stored material.
    pub fn key_material_offset(&self) -> u32 {
        self.key_material_offset
    }

    /// Anti-forensic stripe count.
    pub fn stripes(&self) -> u32 {
        self.stripes
    }
}

/// In-memory LUKS1 header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Luks1Header {
    magic: [u8; 6],
    version: u16,
    cipher_name: [u8; NAME_LEN],
    cipher_mode: [u8; NAME_LEN],
    hash_spec: [u8; NAME_LEN],
    payload_offset: u32,
    key_bytes: u32,
    mk_digest: [u8; LUKS_DIGESTSIZE],
    mk_digest_salt: [u8; LUKS_SALTSIZE],
    mk_digest_iter: u32,
    #[serde(with = "BigArray")]
    uuid: [u8; UUID_LEN],
    key_slots: [KeyslotRecord; LUKS_NUMKEYS],
}

/// Creation parameters for [`Luks1Header::new`].
#[derive(Debug, Clone)]
pub struct HeaderParams<'a> {
    pub cipher_name: &'a str,
    pub cipher_mode: &'a str,
    pub hash_spec: &'a str,
    pub key_bytes: u32,
    pub stripes: u32,
    pub data_alignment: u64,
    pub mk_digest: [u8; LUKS_DIGESTSIZE],
    pub mk_digest_salt: [u8; LUKS_SALTSIZE],
    pub mk_digest_iter: u32,
    pub uuid: &'a str,
}

fn pack_name<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    // one byte reserved for the terminator
    if value.is_empty() || value.len() >= N || value.contains('\0') {
        return Err(LuksError::InvalidParameter(format!(
            "{} {:?} does not fit a {}-byte header field",
            field, value, N
        )));
    }
    let mut out = [0u8; N];
    out[..value.len()].copy_from_slice(value.as_bytes());
    Ok(out)
}

fn unpack_name(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

impl Luks1Header {
    /// Builds a header with all keyslots inactive.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if a name does not fit its field or the
    /// key size is out of range.
    pub fn new(params: &HeaderParams<'_>) -> Result<Self> {
        if params.key_bytes == 0 || params.key_bytes as usize > MAX_VOLUME_KEY_SIZE {
            return Err(LuksError::InvalidParameter(format!(
                "volume key size {} out of range",
                params.key_bytes
            )));
        }
        if params.stripes != LUKS_STRIPES {
            return Err(LuksError::InvalidParameter(format!(
                "stripe count must be {}, got {}",
                LUKS_STRIPES, params.stripes
            )));
        }
        let layout = Layout::compute(params.key_bytes, params.stripes, params.data_alignment)?;
        let key_slots = layout
            .keyslot_offsets
            .map(|offset| KeyslotRecord::disabled(offset, params.stripes));

        Ok(Self {
            magic: LUKS_MAGIC,
            version: LUKS_VERSION,
            cipher_name: pack_name("cipher", params.cipher_name)?,
            cipher_mode: pack_name("cipher mode", params.cipher_mode)?,
            hash_spec: pack_name("hash", params.hash_spec)?,
            payload_offset: layout.payload_offset,
            key_bytes: params.key_bytes,
            mk_digest: params.mk_digest,
            mk_digest_salt: params.mk_digest_salt,
            mk_digest_iter: params.mk_digest_iter,
            uuid: pack_name("uuid", params.uuid)?,
            key_slots,
        })
    }

    /// Checks the structural invariants against a device of `device_size`
    /// bytes: slot areas in bounds, after the header area, before the
    /// payload and pairwise disjoint.
    pub fn validate(&self, device_size: u64) -> Result<()> {
        let corrupt = |msg: String| Err(LuksError::CorruptHeader(msg));

        if self.key_bytes == 0 || self.key_bytes as usize > MAX_VOLUME_KEY_SIZE {
            return corrupt(format!("volume key size {} out of range", self.key_bytes));
        }
        if self.cipher_name().is_empty() || self.cipher_mode().is_empty() || self.hash_spec().is_empty() {
            return corrupt("empty cipher or hash name".into());
        }
        if self.mk_digest_iter == 0 {
            return corrupt("volume key digest iteration count is zero".into());
        }

        let payload = u64::from(self.payload_offset);
        for (i, slot) in self.key_slots.iter().enumerate() {
            if slot.active != KEY_ENABLED && slot.active != KEY_DISABLED {
                return corrupt(format!("keyslot {} has unknown state {:#010x}", i, slot.active));
            }
            // material size is read from disk as key_bytes * stripes
            if slot.stripes != LUKS_STRIPES {
                return corrupt(format!(
                    "keyslot {} has {} stripes, expected {}",
                    i, slot.stripes, LUKS_STRIPES
                ));
            }
            if slot.is_active() && slot.iterations == 0 {
                return corrupt(format!("keyslot {} is active with zero iterations", i));
            }
        }

        let mut areas = Vec::with_capacity(LUKS_NUMKEYS);
        for (i, (start, sectors)) in self.slot_layout().into_iter().enumerate() {
            let end = start + sectors;
            if start < FIRST_KEYSLOT_SECTOR {
                return corrupt(format!("keyslot {} material overlaps the header", i));
            }
            if end > payload {
                return corrupt(format!("keyslot {} material overlaps the payload", i));
            }
            areas.push((start, end, i));
        }

        areas.sort_unstable();
        for pair in areas.windows(2) {
            if pair[0].1 > pair[1].0 {
                return corrupt(format!(
                    "keyslots {} and {} have overlapping material",
                    pair[0].2, pair[1].2
                ));
            }
        }

        if payload * SECTOR_SIZE as u64 > device_size {
            return corrupt(format!(
                "payload offset {} lies beyond the device end ({} bytes)",
                payload, device_size
            ));
        }
        Ok(())
    }

    /// Cipher name, e.g. `aes`.
    pub fn cipher_name(&self) -> &str {
        unpack_name(&self.cipher_name)
    }

    /// Cipher mode, e.g. `xts-plain64`.
    pub fn cipher_mode(&self) -> &str {
        unpack_name(&self.cipher_mode)
    }

    /// Hash name, e.g. `sha256`.
    pub fn hash_spec(&self) -> &str {
        unpack_name(&self.hash_spec)
    }

    /// First payload sector.
    pub fn payload_offset(&self) -> u32 {
        self.payload_offset
    }

    /// Volume key length in bytes.
    pub fn key_bytes(&self) -> u32 {
        self.key_bytes
    }

    pub fn mk_digest(&self) -> &[u8; LUKS_DIGESTSIZE] {
        &self.mk_digest
    }

    pub fn mk_digest_salt(&self) -> &[u8; LUKS_SALTSIZE] {
        &self.mk_digest_salt
    }

    pub fn mk_digest_iter(&self) -> u32 {
        self.mk_digest_iter
    }

    /// Volume UUID in text form.
    pub fn uuid(&self) -> &str {
        unpack_name(&self.uuid)
    }

    /// Header version field.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Keyslot descriptor. Callers check the index first.
    pub fn keyslot(&self, index: usize) -> Option<&KeyslotRecord> {
        self.key_slots.get(index)
    }

    pub(crate) fn keyslot_mut(&mut self, index: usize) -> Option<&mut KeyslotRecord> {
        self.key_slots.get_mut(index)
    }

    /// All keyslot descriptors.
    pub fn keyslots(&self) -> &[KeyslotRecord; LUKS_NUMKEYS] {
        &self.key_slots
    }

    /// Lowest inactive slot index.
    pub fn first_free_slot(&self) -> Option<usize> {
        self.key_slots.iter().position(|slot| !slot.is_active())
    }

    /// Number of active slots.
    pub fn active_count(&self) -> usize {
        self.key_slots.iter().filter(|slot| slot.is_active()).count()
    }

    /// Serializable summary for dumps.
    pub fn info(&self) -> HeaderInfo {
        HeaderInfo {
            format: LUKS1_TYPE.to_string(),
            version: self.version,
            cipher_name: self.cipher_name().to_string(),
            cipher_mode: self.cipher_mode().to_string(),
            hash_spec: self.hash_spec().to_string(),
            payload_offset: self.payload_offset,
            key_bytes: self.key_bytes,
            mk_digest: hex::encode(self.mk_digest),
            mk_digest_salt: hex::encode(self.mk_digest_salt),
            mk_digest_iter: self.mk_digest_iter,
            uuid: self.uuid().to_string(),
            keyslots: self
                .key_slots
                .iter()
                .enumerate()
                .map(|(index, slot)| KeyslotInfo {
                    index,
                    active: slot.is_active(),
                    iterations: slot.iterations,
                    salt: slot.is_active().then(|| hex::encode(slot.salt)),
                    key_material_offset: slot.key_material_offset,
                    stripes: slot.stripes,
                })
                .collect(),
        }
    }
}

impl HeaderFormat for Luks1Header {
    const TYPE: &'static str = LUKS1_TYPE;
    const ENCODED_LEN: usize = HEADER_SIZE;

    fn decode(bytes: &[u8]) -> Result<Self> {
        let version = probe_version(bytes)?;
        if version != LUKS_VERSION {
            return Err(LuksError::UnsupportedVersion(version));
        }
        if bytes.len() != HEADER_SIZE {
            return Err(LuksError::CorruptHeader(format!(
                "expected {} header bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let header: Self = codec().deserialize(bytes)?;
        Ok(header)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let bytes = codec().serialize(self)?;
        if bytes.len() != HEADER_SIZE {
            return Err(LuksError::CorruptHeader(format!(
                "encoded header is {} bytes, expected {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        Ok(bytes)
    }

    fn slot_layout(&self) -> Vec<(u64, u64)> {
        self.key_slots
            .iter()
            .map(|slot| {
                (
                    u64::from(slot.key_material_offset),
                    material_sectors(self.key_bytes, slot.stripes),
                )
            })
            .collect()
    }

    fn digest_algorithm(&self) -> &str {
        self.hash_spec()
    }
}

/// Keyslot part of [`HeaderInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyslotInfo {
    pub index: usize,
    pub active: bool,
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub key_material_offset: u32,
    pub stripes: u32,
}

/// Human-readable header dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub format: String,
    pub version: u16,
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_spec: String,
    pub payload_offset: u32,
    pub key_bytes: u32,
    pub mk_digest: String,
    pub mk_digest_salt: String,
    pub mk_digest_iter: u32,
    pub uuid: String,
    pub keyslots: Vec<KeyslotInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_DATA_ALIGNMENT, LUKS_STRIPES};

    fn params() -> HeaderParams<'static> {
        HeaderParams {
            cipher_name: "aes",
            cipher_mode: "xts-plain64",
            hash_spec: "sha256",
            key_bytes: 64,
            stripes: LUKS_STRIPES,
            data_alignment: DEFAULT_DATA_ALIGNMENT,
            mk_digest: [7u8; LUKS_DIGESTSIZE],
            mk_digest_salt: [8u8; LUKS_SALTSIZE],
            mk_digest_iter: 1000,
            uuid: "0b4e4b8c-3f1a-4c8e-9d3b-5c0e2f6a7b11",
        }
    }

    #[test]
    fn test_layout_matches_cryptsetup() {
        let layout = Layout::compute(64, LUKS_STRIPES, DEFAULT_DATA_ALIGNMENT).unwrap();
        assert_eq!(layout.keyslot_offsets[0], 8);
        assert_eq!(layout.keyslot_offsets[1], 8 + 504);
        assert_eq!(layout.keyslot_offsets[7], 8 + 7 * 504);
        assert_eq!(layout.payload_offset, 4096);

        let layout = Layout::compute(32, LUKS_STRIPES, DEFAULT_DATA_ALIGNMENT).unwrap();
        assert_eq!(layout.keyslot_offsets[1], 8 + 256);
        assert_eq!(layout.payload_offset, 4096);
    }

    #[test]
    fn test_header_encoding() {
        let header = Luks1Header::new(&params()).unwrap();
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..6], &LUKS_MAGIC);
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(&bytes[8..11], b"aes");
        // payload_offset at byte 104, big-endian
        assert_eq!(&bytes[104..108], &4096u32.to_be_bytes());
        // first keyslot state word at byte 208
        assert_eq!(&bytes[208..212], &KEY_DISABLED.to_be_bytes());

        let decoded = Luks1Header::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.cipher_mode(), "xts-plain64");
        assert_eq!(decoded.uuid(), "0b4e4b8c-3f1a-4c8e-9d3b-5c0e2f6a7b11");
    }

    #[test]
    fn test_bad_magic_and_version() {
        let header = Luks1Header::new(&params()).unwrap();
        let mut bytes = header.encode().unwrap();

        bytes[7] = 2;
        assert!(matches!(
            Luks1Header::decode(&bytes),
            Err(LuksError::UnsupportedVersion(2))
        ));

        bytes[0] = b'X';
        assert!(matches!(Luks1Header::decode(&bytes), Err(LuksError::NotLuksHeader)));
        assert!(matches!(probe_version(&[0u8; 4]), Err(LuksError::NotLuksHeader)));
    }

    #[test]
    fn test_validate_accepts_fresh_header() {
        let header = Luks1Header::new(&params()).unwrap();
        header.validate(4096 * 512).unwrap();
        assert!(matches!(
            header.validate(4095 * 512),
            Err(LuksError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_validate_overlapping_slots() {
        let mut header = Luks1Header::new(&params()).unwrap();
        header.key_slots[3].key_material_offset = header.key_slots[2].key_material_offset + 10;
        let err = header.validate(1 << 30).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn test_validate_slot_in_header_area() {
        let mut header = Luks1Header::new(&params()).unwrap();
        header.key_slots[0].key_material_offset = 1;
        assert!(matches!(header.validate(1 << 30), Err(LuksError::CorruptHeader(_))));
    }

    #[test]
    fn test_validate_unknown_state() {
        let mut header = Luks1Header::new(&params()).unwrap();
        header.key_slots[5].active = 0x1234;
        assert!(matches!(header.validate(1 << 30), Err(LuksError::CorruptHeader(_))));
    }

    #[test]
    fn test_validate_rejects_nonstandard_stripes() {
        let mut header = Luks1Header::new(&params()).unwrap();
        header.key_bytes = 128;
        header.key_slots[0].stripes = 33_000_000;
        // payload moved past the inflated material area
        header.payload_offset = u32::MAX;
        let err = header.validate(u64::MAX).unwrap_err();
        assert!(matches!(err, LuksError::CorruptHeader(_)));
        assert!(err.to_string().contains("stripes"));

        let mut header = Luks1Header::new(&params()).unwrap();
        header.key_slots[6].stripes = LUKS_STRIPES - 1;
        assert!(matches!(header.validate(1 << 30), Err(LuksError::CorruptHeader(_))));

        header.key_slots[6].stripes = 0;
        assert!(matches!(header.validate(1 << 30), Err(LuksError::CorruptHeader(_))));
    }

    #[test]
    fn test_new_rejects_nonstandard_stripes() {
        let mut p = params();
        p.stripes = 8;
        assert!(matches!(Luks1Header::new(&p), Err(LuksError::InvalidParameter(_))));
    }

    #[test]
    fn test_slot_layout_matches_records() {
        let header = Luks1Header::new(&params()).unwrap();
        let layout = header.slot_layout();
        assert_eq!(layout.len(), LUKS_NUMKEYS);
        assert_eq!(layout[0], (8, 500));
        assert_eq!(layout[7], (8 + 7 * 504, 500));
        assert_eq!(header.digest_algorithm(), "sha256");
        assert_eq!(Luks1Header::ENCODED_LEN, HEADER_SIZE);
    }

    #[test]
    fn test_name_too_long() {
        let mut p = params();
        p.cipher_mode = "a-mode-name-that-is-far-too-long-for-luks1";
        assert!(matches!(Luks1Header::new(&p), Err(LuksError::InvalidParameter(_))));
    }

    #[test]
    fn test_slot_helpers() {
        let mut header = Luks1Header::new(&params()).unwrap();
        assert_eq!(header.first_free_slot(), Some(0));
        header.keyslot_mut(0).unwrap().enable(2000, [1u8; 32]);
        assert_eq!(header.first_free_slot(), Some(1));
        assert_eq!(header.active_count(), 1);

        let info = header.info();
        assert!(info.keyslots[0].active);
        assert!(info.keyslots[1].salt.is_none());
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"cipher_mode\":\"xts-plain64\""));
    }
}
