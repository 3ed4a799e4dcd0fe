// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Per-device context.
//!
//! A [`CryptDevice`] binds one backing device to its in-memory LUKS1 header
//! and, once unlocked, the volume key. All caller-facing operations live
//! here; they delegate to the keyslot manager, the header store and the
//! injected mapping facility.
//!
//! # Example
//!
//! ```no_run
//! use luks1_vault::{ActivationFlags, CryptDevice, GenericParams, KeyslotSelector, Luks1Params};
//! use std::path::Path;
//!
//! let mut device = CryptDevice::init(Path::new("/dev/sdb1"))?;
//! device.format(&Luks1Params::default(), &GenericParams::new("aes", "xts-plain64", 64))?;
//! device.keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, b"passphrase")?;
//! device.activate_by_passphrase(Some("secret"), KeyslotSelector::Any, b"passphrase", ActivationFlags::NONE)?;
//! device.free();
//! # Ok::<(), luks1_vault::LuksError>(())
//! ```

use super::header::{probe_version, HeaderFormat, HeaderInfo, HeaderParams, Luks1Header};
use super::keyslot::{check_index, KeyslotSelector, Keyslots, SlotState};
use super::manager::{ActivationFlags, DmsetupMapper, MappingFacility, MappingRequest};
use super::master_key::MasterKey;
use crate::config::{
    KdfConfig, DEFAULT_DATA_ALIGNMENT, LUKS1_TYPE, LUKS_ALIGN_KEYSLOTS, LUKS_DIGESTSIZE,
    LUKS_STRIPES, LUKS_VERSION, SECTOR_SIZE,
};
use crate::crypto::kdf::{generate_salt, Pbkdf2Kdf};
use crate::crypto::registry::{DefaultRegistry, PrimitiveRegistry};
use crate::error::{LuksError, Result};
use crate::storage::{commit, wipe_random, wipe_zero, BlockDevice, FileDevice};

use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// LUKS1-specific format parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks1Params {
    /// Hash for PBKDF2, AF diffusion and the volume key digest.
    pub hash: String,
    /// Payload alignment in sectors.
    pub data_alignment: u64,
}

impl Default for Luks1Params {
    fn default() -> Self {
        Self {
            hash: "sha256".to_string(),
            data_alignment: DEFAULT_DATA_ALIGNMENT,
        }
    }
}

impl Luks1Params {
    /// Default alignment with a specific hash.
    pub fn with_hash(hash: &str) -> Self {
        Self {
            hash: hash.to_string(),
            ..Self::default()
        }
    }
}

/// Cipher parameters shared by every format type.
#[derive(Clone)]
pub struct GenericParams {
    /// Cipher name, e.g. `aes`.
    pub cipher: String,
    /// Cipher mode, e.g. `xts-plain64`.
    pub cipher_mode: String,
    /// Volume key to use; generated when `None`.
    pub volume_key: Option<Zeroizing<Vec<u8>>>,
    /// Volume key size in bytes.
    pub volume_key_size: usize,
}

impl GenericParams {
    /// Parameters with a generated volume key.
    pub fn new(cipher: &str, cipher_mode: &str, volume_key_size: usize) -> Self {
        Self {
            cipher: cipher.to_string(),
            cipher_mode: cipher_mode.to_string(),
            volume_key: None,
            volume_key_size,
        }
    }

    /// Uses a caller-supplied volume key.
    pub fn with_volume_key(mut self, key: &[u8]) -> Self {
        self.volume_key = Some(Zeroizing::new(key.to_vec()));
        self
    }
}

impl std::fmt::Debug for GenericParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericParams")
            .field("cipher", &self.cipher)
            .field("cipher_mode", &self.cipher_mode)
            .field("volume_key", &self.volume_key.as_ref().map(|_| "[REDACTED]"))
            .field("volume_key_size", &self.volume_key_size)
            .finish()
    }
}

/// Capabilities injected into a device context.
#[derive(Clone)]
pub struct Backends {
    /// Resolves cipher, mode and hash names.
    pub registry: Arc<dyn PrimitiveRegistry>,
    /// Creates and removes named mappings.
    pub mapper: Arc<dyn MappingFacility>,
    /// PBKDF2 cost for new keyslots and digests.
    pub kdf: KdfConfig,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            registry: Arc::new(DefaultRegistry),
            mapper: Arc::new(DmsetupMapper::new()),
            kdf: KdfConfig::default(),
        }
    }
}

impl Backends {
    /// Default registry and KDF cost with a specific mapping facility.
    pub fn with_mapper(mapper: Arc<dyn MappingFacility>) -> Self {
        Self {
            mapper,
            ..Self::default()
        }
    }

    /// Replaces the KDF cost.
    pub fn kdf(mut self, kdf: KdfConfig) -> Self {
        self.kdf = kdf;
        self
    }
}

/// One open view of one LUKS1 device.
pub struct CryptDevice {
    device: Box<dyn BlockDevice>,
    header: Option<Luks1Header>,
    volume_key: Option<MasterKey>,
    backends: Backends,
}

fn as_invalid(err: LuksError) -> LuksError {
    match err {
        LuksError::UnsupportedPrimitive(what) => {
            LuksError::InvalidParameter(format!("unsupported {}", what))
        }
        other => other,
    }
}

/// Random RFC 4122 version 4 UUID in text form.
fn generate_uuid() -> Result<String> {
    let mut b = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut b)
        .map_err(|e| LuksError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let h = hex::encode(b);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    ))
}

impl CryptDevice {
    /// Opens a device or image file with the default backends.
    pub fn init(path: &Path) -> Result<Self> {
        Self::init_with(path, Backends::default())
    }

    /// Opens a device or image file with explicit backends.
    pub fn init_with(path: &Path, backends: Backends) -> Result<Self> {
        let device = FileDevice::open(path)?;
        Ok(Self::init_with_device(Box::new(device), backends))
    }

    /// Wraps an already open block device.
    pub fn init_with_device(device: Box<dyn BlockDevice>, backends: Backends) -> Self {
        Self {
            device,
            header: None,
            volume_key: None,
            backends,
        }
    }

    /// Attaches to the device behind an active mapping, with default backends.
    pub fn init_by_name(name: &str) -> Result<Self> {
        Self::init_by_name_with(name, Backends::default())
    }

    /// Attaches to the device behind an active mapping and loads its header.
    ///
    /// # Errors
    ///
    /// `MappingNotFound` if `name` is not active.
    pub fn init_by_name_with(name: &str, backends: Backends) -> Result<Self> {
        let mapping = backends.mapper.query(name)?;
        let mut ctx = Self::init_with(Path::new(&mapping.backing), backends)?;
        ctx.load(None)?;

        if let Some(header) = &ctx.header {
            if u64::from(header.payload_offset()) != mapping.payload_offset {
                tracing::warn!(
                    name,
                    mapping_offset = mapping.payload_offset,
                    header_offset = header.payload_offset(),
                    "mapping offset differs from header"
                );
            }
        }
        Ok(ctx)
    }

    /// Writes a new LUKS1 header with all keyslots inactive.
    ///
    /// The volume key comes from `params` or is generated. It stays cached in
    /// this context so keyslots can be added without a passphrase.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown cipher, mode or hash, a key size the
    /// cipher does not accept, or a device too small for the header.
    pub fn format(&mut self, luks1: &Luks1Params, params: &GenericParams) -> Result<()> {
        let registry = Arc::clone(&self.backends.registry);
        let hash = registry.hash(&luks1.hash).map_err(as_invalid)?;

        let key = match &params.volume_key {
            Some(key) if !key.is_empty() => {
                if params.volume_key_size != 0 && params.volume_key_size != key.len() {
                    return Err(LuksError::InvalidParameter(format!(
                        "volume key is {} bytes but {} were requested",
                        key.len(),
                        params.volume_key_size
                    )));
                }
                MasterKey::from_bytes(key)?
            }
            _ => MasterKey::generate(params.volume_key_size)?,
        };
        registry
            .check_cipher(&params.cipher, &params.cipher_mode, key.len())
            .map_err(as_invalid)?;

        let kdf = Pbkdf2Kdf::new(hash);
        let digest_iter = kdf.iterations_for(
            &self.backends.kdf,
            self.backends.kdf.digest_time_ms,
            LUKS_DIGESTSIZE,
        )?;
        let digest_salt = generate_salt()?;
        let digest = key.digest(hash, &digest_salt, digest_iter)?;
        let uuid = generate_uuid()?;

        let header = Luks1Header::new(&HeaderParams {
            cipher_name: &params.cipher,
            cipher_mode: &params.cipher_mode,
            hash_spec: hash.name(),
            key_bytes: key.len() as u32,
            stripes: LUKS_STRIPES,
            data_alignment: luks1.data_alignment,
            mk_digest: digest,
            mk_digest_salt: digest_salt,
            mk_digest_iter: digest_iter,
            uuid: &uuid,
        })?;

        let device_size = self.device.size()?;
        let payload_bytes = u64::from(header.payload_offset()) * SECTOR_SIZE as u64;
        if device_size < payload_bytes {
            return Err(LuksError::InvalidParameter(format!(
                "device of {} bytes is smaller than the {} byte header area",
                device_size, payload_bytes
            )));
        }
        header.validate(device_size)?;

        wipe_zero(self.device.as_mut(), 0, LUKS_ALIGN_KEYSLOTS)?;
        wipe_random(
            self.device.as_mut(),
            LUKS_ALIGN_KEYSLOTS,
            payload_bytes - LUKS_ALIGN_KEYSLOTS,
        )?;
        self.device.sync()?;
        commit::commit_header(self.device.as_mut(), &header.encode()?)?;

        tracing::info!(
            device = %self.device.identity(),
            cipher = %format!("{}-{}", params.cipher, params.cipher_mode),
            hash = hash.name(),
            key_bits = key.len() * 8,
            uuid = %uuid,
            "formatted LUKS1 volume"
        );
        self.header = Some(header);
        self.volume_key = Some(key);
        Ok(())
    }

    /// Reads and validates the on-disk header.
    ///
    /// An interrupted header update is rolled forward first. Any cached
    /// volume key and previously loaded header are dropped, also when the
    /// load fails. `requested_type`, when given, must be `LUKS1`.
    ///
    /// # Errors
    ///
    /// `NotLuksHeader`, `UnsupportedVersion` or `CorruptHeader`.
    pub fn load(&mut self, requested_type: Option<&str>) -> Result<()> {
        if let Some(kind) = requested_type {
            if kind != LUKS1_TYPE {
                return Err(LuksError::InvalidParameter(format!("unsupported device type {}", kind)));
            }
        }

        self.volume_key = None;
        self.header = None;

        commit::recover(self.device.as_mut())?;

        let device_size = self.device.size()?;
        if device_size < Luks1Header::ENCODED_LEN as u64 {
            return Err(LuksError::NotLuksHeader);
        }
        let mut bytes = vec![0u8; Luks1Header::ENCODED_LEN];
        self.device.read_at(0, &mut bytes)?;

        let header = match probe_version(&bytes)? {
            LUKS_VERSION => Luks1Header::decode(&bytes)?,
            other => return Err(LuksError::UnsupportedVersion(other)),
        };
        header.validate(device_size)?;
        self.backends.registry.hash(header.hash_spec())?;

        tracing::debug!(
            device = %self.device.identity(),
            active_slots = header.active_count(),
            "loaded LUKS1 header"
        );
        self.header = Some(header);
        Ok(())
    }

    fn keyslots(&mut self) -> Result<Keyslots<'_>> {
        let header = self.header.as_mut().ok_or(LuksError::NotLoaded)?;
        Ok(Keyslots::new(
            self.device.as_mut(),
            header,
            self.backends.registry.as_ref(),
            &self.backends.kdf,
        ))
    }

    fn resolve_target(&self, target: KeyslotSelector) -> Result<usize> {
        let header = self.header.as_ref().ok_or(LuksError::NotLoaded)?;
        match target {
            KeyslotSelector::Slot(index) => {
                check_index(index)?;
                if header.keyslot(index).is_some_and(|s| s.is_active()) {
                    return Err(LuksError::SlotOccupied(index));
                }
                Ok(index)
            }
            KeyslotSelector::Any => header.first_free_slot().ok_or(LuksError::NoKeyslotAvailable),
        }
    }

    /// Stores a volume key in a keyslot under `passphrase`.
    ///
    /// `volume_key` of `None` (or empty) uses the key cached in this context.
    /// [`KeyslotSelector::Any`] picks the lowest free slot. Returns the slot
    /// used.
    ///
    /// # Errors
    ///
    /// `SlotOccupied` if the slot is active, `NoVolumeKey` if no key is
    /// available, `VolumeKeyMismatch` if the supplied key is wrong.
    pub fn keyslot_add_by_volume_key(
        &mut self,
        target: KeyslotSelector,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> Result<usize> {
        let index = self.resolve_target(target)?;
        let key = match volume_key.filter(|k| !k.is_empty()) {
            Some(bytes) => MasterKey::from_bytes(bytes)?,
            None => self.volume_key.clone().ok_or(LuksError::NoVolumeKey)?,
        };
        self.keyslots()?.add(index, &key, passphrase)?;
        Ok(index)
    }

    /// Stores the volume key in a keyslot under `new_passphrase`.
    ///
    /// If this context already holds the volume key it is used directly;
    /// otherwise `unlock_passphrase` must open an active slot. Returns the
    /// slot used.
    pub fn keyslot_add_by_passphrase(
        &mut self,
        target: KeyslotSelector,
        unlock_passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Result<usize> {
        let index = self.resolve_target(target)?;
        let key = match self.volume_key.clone() {
            Some(key) => key,
            None => {
                let (_, key) = self
                    .keyslots()?
                    .verify_passphrase(KeyslotSelector::Any, unlock_passphrase)?;
                self.volume_key = Some(key.clone());
                key
            }
        };
        self.keyslots()?.add(index, &key, new_passphrase)?;
        Ok(index)
    }

    /// Replaces the passphrase stored in `current`, writing the result to
    /// `target` (which may equal `current`). Returns `target`.
    ///
    /// # Errors
    ///
    /// `PassphraseMismatch` if `old_passphrase` does not open `current`.
    pub fn keyslot_change_by_passphrase(
        &mut self,
        current: usize,
        target: usize,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Result<usize> {
        self.keyslots()?
            .change(current, target, old_passphrase, new_passphrase)?;
        Ok(target)
    }

    /// Wipes a keyslot's material and marks it inactive.
    pub fn keyslot_destroy(&mut self, slot: usize) -> Result<()> {
        self.keyslots()?.destroy(slot)
    }

    /// Whether a keyslot is active.
    pub fn keyslot_status(&self, slot: usize) -> Result<SlotState> {
        check_index(slot)?;
        let header = self.header.as_ref().ok_or(LuksError::NotLoaded)?;
        Ok(match header.keyslot(slot) {
            Some(record) if record.is_active() => SlotState::Active,
            _ => SlotState::Inactive,
        })
    }

    /// Unlocks the volume key with a passphrase and, when `name` is given,
    /// creates the decrypted mapping. Returns the slot that matched.
    ///
    /// With `name` of `None` the passphrase is only checked.
    pub fn activate_by_passphrase(
        &mut self,
        name: Option<&str>,
        selector: KeyslotSelector,
        passphrase: &[u8],
        flags: ActivationFlags,
    ) -> Result<usize> {
        let (slot, key) = self.keyslots()?.verify_passphrase(selector, passphrase)?;
        if let Some(name) = name {
            self.map(name, &key, flags)?;
        }
        self.volume_key = Some(key);
        Ok(slot)
    }

    /// Checks a volume key against the header digest and, when `name` is
    /// given, creates the mapping with it.
    ///
    /// `volume_key` of `None` (or empty) uses the key cached in this
    /// context, such as the one generated by [`CryptDevice::format`].
    ///
    /// # Errors
    ///
    /// `NoVolumeKey` if there is nothing to use, `VolumeKeyMismatch` if the
    /// key does not match the header.
    pub fn activate_by_volume_key(
        &mut self,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        flags: ActivationFlags,
    ) -> Result<()> {
        let key = match volume_key.filter(|k| !k.is_empty()) {
            Some(bytes) => MasterKey::from_bytes(bytes)?,
            None => self.volume_key.clone().ok_or(LuksError::NoVolumeKey)?,
        };
        if !self.keyslots()?.matches_digest(&key)? {
            return Err(LuksError::VolumeKeyMismatch);
        }
        if let Some(name) = name {
            self.map(name, &key, flags)?;
        }
        self.volume_key = Some(key);
        Ok(())
    }

    fn map(&mut self, name: &str, key: &MasterKey, flags: ActivationFlags) -> Result<()> {
        let header = self.header.as_ref().ok_or(LuksError::NotLoaded)?;
        let device_sectors = self.device.size()? / SECTOR_SIZE as u64;
        let payload_offset = u64::from(header.payload_offset());

        let request = MappingRequest {
            name,
            cipher_spec: format!("{}-{}", header.cipher_name(), header.cipher_mode()),
            key: key.as_bytes(),
            backing: self.device.identity(),
            payload_offset,
            size_sectors: device_sectors.saturating_sub(payload_offset),
            flags,
            uuid: Some(header.uuid().to_string()).filter(|u| !u.is_empty()),
        };
        self.backends.mapper.activate(&request)?;
        tracing::info!(
            name,
            read_only = flags.contains(ActivationFlags::READ_ONLY),
            "mapping activated"
        );
        Ok(())
    }

    /// Removes a named mapping. Works without a loaded header.
    pub fn deactivate(&self, name: &str) -> Result<()> {
        self.backends.mapper.deactivate(name)?;
        tracing::info!(name, "mapping deactivated");
        Ok(())
    }

    /// Zeroes the cached volume key.
    pub fn lock(&mut self) {
        self.volume_key = None;
    }

    /// Releases the context. Active mappings stay active.
    pub fn free(self) {}

    /// Format identifier of the loaded header, `None` before Format/Load.
    pub fn device_type(&self) -> Option<&'static str> {
        self.header.as_ref().map(|_| <Luks1Header as HeaderFormat>::TYPE)
    }

    /// UUID of the loaded header.
    pub fn uuid(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.uuid())
    }

    /// Loaded header.
    pub fn header(&self) -> Option<&Luks1Header> {
        self.header.as_ref()
    }

    /// Returns true while the volume key is cached.
    pub fn is_unlocked(&self) -> bool {
        self.volume_key.is_some()
    }

    /// Serializable summary of the loaded header.
    pub fn dump(&self) -> Result<HeaderInfo> {
        self.header
            .as_ref()
            .map(Luks1Header::info)
            .ok_or(LuksError::NotLoaded)
    }
}

impl std::fmt::Debug for CryptDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptDevice")
            .field("device", &self.device.identity())
            .field("type", &self.device_type())
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDevice;
    use crate::volume::manager::MemoryMapper;

    const DEVICE_SIZE: usize = 4 * 1024 * 1024;

    fn context(mapper: &MemoryMapper) -> (CryptDevice, MemoryDevice) {
        let image = MemoryDevice::new(DEVICE_SIZE).with_name("/dev/mem0");
        let backends = Backends::with_mapper(Arc::new(mapper.clone())).kdf(KdfConfig::fast());
        (CryptDevice::init_with_device(Box::new(image.clone()), backends), image)
    }

    fn params() -> GenericParams {
        GenericParams::new("aes", "xts-plain64", 64)
    }

    #[test]
    fn test_format_sets_type_and_uuid() {
        let mapper = MemoryMapper::new();
        let (mut dev, image) = context(&mapper);
        assert_eq!(dev.device_type(), None);

        dev.format(&Luks1Params::default(), &params()).unwrap();
        assert_eq!(dev.device_type(), Some("LUKS1"));
        let uuid = dev.uuid().unwrap().to_string();
        assert_eq!(uuid.len(), 36);
        assert_eq!(&uuid[14..15], "4");

        let bytes = image.snapshot().unwrap();
        assert_eq!(&bytes[..6], b"LUKS\xba\xbe");
        assert_eq!(dev.header().unwrap().payload_offset(), 4096);
    }

    #[test]
    fn test_format_rejects_bad_parameters() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        let err = dev
            .format(&Luks1Params::with_hash("md4"), &params())
            .unwrap_err();
        assert!(matches!(err, LuksError::InvalidParameter(_)));

        let err = dev
            .format(&Luks1Params::default(), &GenericParams::new("twofish", "xts-plain64", 64))
            .unwrap_err();
        assert!(matches!(err, LuksError::InvalidParameter(_)));

        let err = dev
            .format(&Luks1Params::default(), &GenericParams::new("aes", "xts-plain64", 20))
            .unwrap_err();
        assert_eq!(err.code(), -22);
        assert_eq!(dev.device_type(), None);
    }

    #[test]
    fn test_format_device_too_small() {
        let image = MemoryDevice::new(1024 * 1024);
        let backends = Backends::with_mapper(Arc::new(MemoryMapper::new())).kdf(KdfConfig::fast());
        let mut dev = CryptDevice::init_with_device(Box::new(image), backends);
        assert!(matches!(
            dev.format(&Luks1Params::default(), &params()),
            Err(LuksError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_load_unformatted_device() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        assert!(matches!(dev.load(None), Err(LuksError::NotLuksHeader)));
        assert!(matches!(dev.load(Some("LUKS2")), Err(LuksError::InvalidParameter(_))));
    }

    #[test]
    fn test_failed_load_drops_cached_state() {
        let mapper = MemoryMapper::new();
        let (mut dev, image) = context(&mapper);
        dev.format(&Luks1Params::default(), &params()).unwrap();
        let pristine = image.snapshot().unwrap();

        image.poke(0, b"XXXX").unwrap();
        assert!(matches!(dev.load(None), Err(LuksError::NotLuksHeader)));
        assert_eq!(dev.device_type(), None);
        assert!(matches!(
            dev.keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, b"pw"),
            Err(LuksError::NotLoaded)
        ));

        image.poke(0, &pristine[..8]).unwrap();
        dev.load(None).unwrap();
        assert!(matches!(
            dev.keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, b"pw"),
            Err(LuksError::NoVolumeKey)
        ));
    }

    #[test]
    fn test_operations_need_header() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        assert!(matches!(
            dev.keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, b"pw"),
            Err(LuksError::NotLoaded)
        ));
        assert!(matches!(dev.dump(), Err(LuksError::NotLoaded)));
    }

    #[test]
    fn test_add_by_volume_key_needs_key_after_load() {
        let mapper = MemoryMapper::new();
        let (mut dev, image) = context(&mapper);
        dev.format(&Luks1Params::default(), &params()).unwrap();
        dev.free();

        let backends = Backends::with_mapper(Arc::new(mapper.clone())).kdf(KdfConfig::fast());
        let mut dev = CryptDevice::init_with_device(Box::new(image), backends);
        dev.load(None).unwrap();
        let err = dev
            .keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, b"pw")
            .unwrap_err();
        assert!(matches!(err, LuksError::NoVolumeKey));
    }

    #[test]
    fn test_activate_by_supplied_key() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        let key = [0x11u8; 64];
        dev.format(&Luks1Params::default(), &params().with_volume_key(&key))
            .unwrap();
        dev.lock();

        let wrong = [0x22u8; 64];
        assert!(matches!(
            dev.activate_by_volume_key(Some("v"), Some(&wrong[..]), ActivationFlags::NONE),
            Err(LuksError::VolumeKeyMismatch)
        ));
        assert!(matches!(
            dev.activate_by_volume_key(Some("v"), None, ActivationFlags::NONE),
            Err(LuksError::NoVolumeKey)
        ));

        dev.activate_by_volume_key(Some("v"), Some(&key[..]), ActivationFlags::READ_ONLY)
            .unwrap();
        let mapping = mapper.query("v").unwrap();
        assert_eq!(mapping.cipher_spec, "aes-xts-plain64");
        assert_eq!(mapping.payload_offset, 4096);
        assert_eq!(mapping.size_sectors, (DEVICE_SIZE / 512) as u64 - 4096);
        assert_eq!(mapping.backing, "/dev/mem0");
        assert!(mapping.read_only);
        assert_eq!(&mapper.mapped_key("v").unwrap()[..], &key[..]);
    }

    #[test]
    fn test_activate_without_name_only_verifies() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        dev.format(&Luks1Params::default(), &params()).unwrap();
        dev.keyslot_add_by_volume_key(KeyslotSelector::Any, None, b"pw")
            .unwrap();
        dev.lock();
        assert!(!dev.is_unlocked());

        let slot = dev
            .activate_by_passphrase(None, KeyslotSelector::Any, b"pw", ActivationFlags::NONE)
            .unwrap();
        assert_eq!(slot, 0);
        assert!(dev.is_unlocked());
        assert!(mapper.list().is_empty());
    }

    #[test]
    fn test_any_target_picks_lowest_free() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        dev.format(&Luks1Params::default(), &params()).unwrap();
        dev.keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, b"a")
            .unwrap();
        dev.keyslot_add_by_volume_key(KeyslotSelector::Slot(2), None, b"b")
            .unwrap();
        let slot = dev
            .keyslot_add_by_volume_key(KeyslotSelector::Any, None, b"c")
            .unwrap();
        assert_eq!(slot, 1);
        assert_eq!(dev.keyslot_status(1).unwrap(), SlotState::Active);
        assert_eq!(dev.keyslot_status(3).unwrap(), SlotState::Inactive);
    }

    #[test]
    fn test_dump() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        dev.format(&Luks1Params::with_hash("sha1"), &GenericParams::new("aes", "cbc-essiv:sha256", 32))
            .unwrap();
        let info = dev.dump().unwrap();
        assert_eq!(info.hash_spec, "sha1");
        assert_eq!(info.cipher_mode, "cbc-essiv:sha256");
        assert_eq!(info.key_bytes, 32);
        assert_eq!(info.keyslots.len(), 8);
        assert!(info.keyslots.iter().all(|k| !k.active));
    }

    #[test]
    fn test_debug_hides_key() {
        let mapper = MemoryMapper::new();
        let (mut dev, _) = context(&mapper);
        dev.format(&Luks1Params::default(), &params().with_volume_key(&[0x5a; 64]))
            .unwrap();
        let debug = format!("{:?} {:?}", dev, params().with_volume_key(&[0x5a; 64]));
        assert!(!debug.contains("5a5a"));
        assert!(!debug.contains("90, 90"));
    }
}
