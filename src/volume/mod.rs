// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! LUKS1 volume management module
//!
//! This module provides the on-disk header, the keyslot manager, the volume
//! key holder, the activation backends and the per-device context that ties
//! them together.

pub mod device;
pub mod header;
pub mod keyslot;
pub mod manager;
pub mod master_key;

pub use device::{Backends, CryptDevice, GenericParams, Luks1Params};
pub use header::{HeaderFormat, HeaderInfo, KeyslotInfo, Luks1Header, HEADER_SIZE};
pub use keyslot::{KeyslotSelector, Keyslots, SlotState};
pub use manager::{ActivationFlags, ActiveMapping, DmsetupMapper, MappingFacility, MappingRequest, MemoryMapper};
pub use master_key::MasterKey;
