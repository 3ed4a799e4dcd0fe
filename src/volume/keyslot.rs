// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Keyslot management for LUKS1 volumes.
//!
//! Each of the eight keyslots stores the volume key AF-split into
//! `stripes` copies and encrypted with a key-encryption key (KEK) derived
//! from one passphrase. Any slot whose passphrase is known yields the same
//! volume key, so several passphrases can open one volume.
//!
//! Every mutation follows the same order: material is written and synced
//! first, then the header is committed through the staged write in
//! [`crate::storage::commit`]. The in-memory header only changes after the
//! commit succeeds.

use super::header::{HeaderFormat, Luks1Header};
use super::master_key::MasterKey;
use crate::config::{KdfConfig, LUKS_NUMKEYS, LUKS_SALTSIZE, SECTOR_SIZE};
use crate::crypto::af;
use crate::crypto::kdf::{generate_salt, Pbkdf2Kdf};
use crate::crypto::registry::{HashAlgorithm, PrimitiveRegistry};
use crate::crypto::KeyDerivation;
use crate::error::{LuksError, Result};
use crate::storage::{commit, wipe_random, BlockDevice};

use zeroize::Zeroizing;

/// Which keyslots an unlock may try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyslotSelector {
    /// Every active slot.
    Any,
    /// One specific slot.
    Slot(usize),
}

impl From<usize> for KeyslotSelector {
    fn from(index: usize) -> Self {
        Self::Slot(index)
    }
}

/// Keyslot state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot holds no key.
    Inactive,
    /// Slot holds the volume key under some passphrase.
    Active,
}

/// KEK plus the parameters it was derived with.
struct Wrapping {
    kek: Zeroizing<Vec<u8>>,
    salt: [u8; LUKS_SALTSIZE],
    iterations: u32,
}

/// Borrowed view over one device's header and keyslot material.
pub struct Keyslots<'a> {
    device: &'a mut dyn BlockDevice,
    header: &'a mut Luks1Header,
    registry: &'a dyn PrimitiveRegistry,
    kdf_config: &'a KdfConfig,
}

pub(crate) fn check_index(index: usize) -> Result<()> {
    if index >= LUKS_NUMKEYS {
        return Err(LuksError::InvalidSlot(index));
    }
    Ok(())
}

impl<'a> Keyslots<'a> {
    /// Binds the keyslot operations to a device and its loaded header.
    pub fn new(
        device: &'a mut dyn BlockDevice,
        header: &'a mut Luks1Header,
        registry: &'a dyn PrimitiveRegistry,
        kdf_config: &'a KdfConfig,
    ) -> Self {
        Self {
            device,
            header,
            registry,
            kdf_config,
        }
    }

    fn hash(&self) -> Result<HashAlgorithm> {
        self.registry.hash(self.header.digest_algorithm())
    }

    fn key_len(&self) -> usize {
        self.header.key_bytes() as usize
    }

    /// Byte range of a slot's material area, padded to whole sectors.
    fn material_area(&self, index: usize) -> Result<(u64, usize)> {
        let (first, sectors) = *self
            .header
            .slot_layout()
            .get(index)
            .ok_or(LuksError::InvalidSlot(index))?;
        Ok((first * SECTOR_SIZE as u64, sectors as usize * SECTOR_SIZE))
    }

    /// State of one slot.
    pub fn status(&self, index: usize) -> Result<SlotState> {
        check_index(index)?;
        let active = self.header.keyslot(index).is_some_and(|s| s.is_active());
        Ok(if active { SlotState::Active } else { SlotState::Inactive })
    }

    fn derive_kek(&self, passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<Zeroizing<Vec<u8>>> {
        Pbkdf2Kdf::new(self.hash()?).derive_key(passphrase, salt, iterations, self.key_len())
    }

    /// Fresh salt, calibrated iteration count and the KEK for `passphrase`.
    fn new_wrapping(&self, passphrase: &[u8]) -> Result<Wrapping> {
        let kdf = Pbkdf2Kdf::new(self.hash()?);
        let iterations = kdf.iterations_for(
            self.kdf_config,
            self.kdf_config.iteration_time_ms,
            self.key_len(),
        )?;
        let salt = generate_salt()?;
        let kek = kdf.derive_key(passphrase, &salt, iterations, self.key_len())?;
        Ok(Wrapping {
            kek,
            salt,
            iterations,
        })
    }

    /// Splits, encrypts and writes `key` into a slot's material area.
    fn write_material(&mut self, index: usize, key: &MasterKey, kek: &[u8]) -> Result<()> {
        let stripes = self
            .header
            .keyslot(index)
            .ok_or(LuksError::InvalidSlot(index))?
            .stripes();
        let (offset, padded_len) = self.material_area(index)?;

        let split = af::split(key.as_bytes(), stripes, self.hash()?)?;
        let mut buf = Zeroizing::new(vec![0u8; padded_len]);
        buf[..split.len()].copy_from_slice(&split);

        let cipher = self.registry.sector_cipher(
            self.header.cipher_name(),
            self.header.cipher_mode(),
            kek,
        )?;
        cipher.encrypt_sectors(&mut buf, 0)?;

        self.device.write_at(offset, &buf)?;
        self.device.sync()
    }

    /// Reads, decrypts and merges a slot's material with `kek`.
    fn read_material(&mut self, index: usize, kek: &[u8]) -> Result<MasterKey> {
        let stripes = self
            .header
            .keyslot(index)
            .ok_or(LuksError::InvalidSlot(index))?
            .stripes();
        let (offset, padded_len) = self.material_area(index)?;

        let mut buf = Zeroizing::new(vec![0u8; padded_len]);
        self.device.read_at(offset, &mut buf)?;

        let cipher = self.registry.sector_cipher(
            self.header.cipher_name(),
            self.header.cipher_mode(),
            kek,
        )?;
        cipher.decrypt_sectors(&mut buf, 0)?;

        let material_len = self.key_len() * stripes as usize;
        let key = af::merge(&buf[..material_len], stripes, self.hash()?)?;
        MasterKey::from_bytes(&key)
    }

    /// Checks `key` against the header digest.
    pub fn matches_digest(&self, key: &MasterKey) -> Result<bool> {
        if key.len() != self.key_len() {
            return Ok(false);
        }
        key.matches_digest(
            self.hash()?,
            self.header.mk_digest_salt(),
            self.header.mk_digest_iter(),
            self.header.mk_digest(),
        )
    }

    /// Re-reads a freshly written slot and confirms it yields `key`.
    fn verify_written(&mut self, index: usize, kek: &[u8]) -> Result<()> {
        let stored = self.read_material(index, kek)?;
        if !self.matches_digest(&stored)? {
            return Err(LuksError::IntegrityError(format!(
                "keyslot {} material did not read back intact",
                index
            )));
        }
        Ok(())
    }

    /// Encodes and durably writes `next`, then adopts it in memory.
    fn commit(&mut self, next: Luks1Header) -> Result<()> {
        let bytes = next.encode()?;
        commit::commit_header(self.device, &bytes)?;
        *self.header = next;
        Ok(())
    }

    /// Writes `wrapping` into a slot, verifies it and marks it active.
    fn install(&mut self, index: usize, key: &MasterKey, wrapping: &Wrapping) -> Result<()> {
        self.write_material(index, key, &wrapping.kek)?;
        self.verify_written(index, &wrapping.kek)?;

        let mut next = self.header.clone();
        next.keyslot_mut(index)
            .ok_or(LuksError::InvalidSlot(index))?
            .enable(wrapping.iterations, wrapping.salt);
        self.commit(next)
    }

    /// Wipes a slot's material and marks it inactive.
    fn erase(&mut self, index: usize) -> Result<()> {
        let (offset, len) = self.material_area(index)?;
        wipe_random(self.device, offset, len as u64)?;
        self.device.sync()?;

        let mut next = self.header.clone();
        next.keyslot_mut(index).ok_or(LuksError::InvalidSlot(index))?.disable();
        self.commit(next)
    }

    /// Stores `key` in an inactive slot under `passphrase`.
    ///
    /// # Errors
    ///
    /// `InvalidSlot` for an out-of-range index, `SlotOccupied` if the slot is
    /// active, `VolumeKeyMismatch` if `key` is not this volume's key.
    pub fn add(&mut self, index: usize, key: &MasterKey, passphrase: &[u8]) -> Result<()> {
        check_index(index)?;
        if self.status(index)? == SlotState::Active {
            return Err(LuksError::SlotOccupied(index));
        }
        if !self.matches_digest(key)? {
            return Err(LuksError::VolumeKeyMismatch);
        }

        let wrapping = self.new_wrapping(passphrase)?;
        self.install(index, key, &wrapping)?;
        tracing::info!(slot = index, iterations = wrapping.iterations, "keyslot added");
        Ok(())
    }

    /// Lowest inactive slot index.
    pub fn first_free(&self) -> Result<usize> {
        self.header.first_free_slot().ok_or(LuksError::NoKeyslotAvailable)
    }

    /// Overwrites a slot's material, then marks it inactive.
    pub fn destroy(&mut self, index: usize) -> Result<()> {
        check_index(index)?;
        if self.status(index)? == SlotState::Inactive {
            return Err(LuksError::SlotInactive(index));
        }
        self.erase(index)?;
        tracing::info!(slot = index, "keyslot destroyed");
        Ok(())
    }

    /// Tries one active slot. `None` means the passphrase is wrong for it.
    fn try_slot(&mut self, index: usize, passphrase: &[u8]) -> Result<Option<MasterKey>> {
        let slot = *self.header.keyslot(index).ok_or(LuksError::InvalidSlot(index))?;
        let kek = self.derive_kek(passphrase, slot.salt(), slot.iterations())?;
        let candidate = self.read_material(index, &kek)?;
        Ok(self.matches_digest(&candidate)?.then_some(candidate))
    }

    /// Finds the slot `passphrase` opens and returns its volume key.
    ///
    /// Every candidate slot is fully evaluated, even after a match, so the
    /// running time does not depend on which slot matched. The digest
    /// comparison itself is constant time.
    ///
    /// # Errors
    ///
    /// `PassphraseMismatch` if no candidate slot accepts the passphrase,
    /// `SlotInactive` if an explicitly selected slot is empty.
    pub fn verify_passphrase(
        &mut self,
        selector: KeyslotSelector,
        passphrase: &[u8],
    ) -> Result<(usize, MasterKey)> {
        let candidates: Vec<usize> = match selector {
            KeyslotSelector::Slot(index) => {
                if self.status(index)? == SlotState::Inactive {
                    return Err(LuksError::SlotInactive(index));
                }
                vec![index]
            }
            KeyslotSelector::Any => (0..LUKS_NUMKEYS)
                .filter(|&i| self.header.keyslot(i).is_some_and(|s| s.is_active()))
                .collect(),
        };

        let mut found: Option<(usize, MasterKey)> = None;
        for index in candidates {
            let result = self.try_slot(index, passphrase)?;
            if found.is_none() {
                found = result.map(|key| (index, key));
            }
        }

        match found {
            Some((index, key)) => {
                tracing::debug!(slot = index, "passphrase accepted");
                Ok((index, key))
            }
            None => Err(LuksError::PassphraseMismatch),
        }
    }

    /// Replaces the passphrase of `current` with `new_passphrase`, storing
    /// the result in `target`.
    ///
    /// With distinct indices the key is added to `target` before `current`
    /// is destroyed. With equal indices the new wrapping is first parked in
    /// a free slot, then `current` is rewritten, then the parked copy is
    /// erased; some passphrase can open the volume at every commit point.
    /// With no free slot the rewrite happens in place.
    pub fn change(
        &mut self,
        current: usize,
        target: usize,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Result<()> {
        check_index(current)?;
        check_index(target)?;
        let (_, key) = self.verify_passphrase(KeyslotSelector::Slot(current), old_passphrase)?;

        if target != current {
            if self.status(target)? == SlotState::Active {
                return Err(LuksError::SlotOccupied(target));
            }
            self.add(target, &key, new_passphrase)?;
            self.destroy(current)?;
            tracing::info!(from = current, to = target, "keyslot passphrase moved");
            return Ok(());
        }

        let wrapping = self.new_wrapping(new_passphrase)?;
        match self.header.first_free_slot() {
            Some(parking) => {
                self.install(parking, &key, &wrapping)?;
                self.erase(current)?;
                self.install(current, &key, &wrapping)?;
                self.erase(parking)?;
            }
            None => {
                tracing::warn!(
                    slot = current,
                    "no free keyslot, rewriting in place; an interruption loses this slot"
                );
                self.erase(current)?;
                self.install(current, &key, &wrapping)?;
            }
        }
        tracing::info!(slot = current, "keyslot passphrase changed");
        Ok(())
    }
}
