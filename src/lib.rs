// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! LUKS1 Vault - an encrypted block-device container engine
//!
//! This library reads and writes the LUKS1 on-disk format: one header, one
//! volume key and eight keyslots that each wrap the volume key under a
//! different passphrase.
//!
//! # Features
//!
//! - **Anti-forensic keyslots**: keys are AF-split over 4000 stripes
//! - **Calibrated PBKDF2**: per-slot iteration counts from a time target
//! - **Crash-safe header writes**: staged commit with roll-forward on load
//! - **Constant-time unlock**: every active slot is tried, digests compared
//!   in constant time
//! - **Pluggable backends**: primitive registry and mapping facility are
//!   injected traits
//! - **Memory safety**: volume keys and KEKs are zeroized
//!
//! # Example
//!
//! ```no_run
//! use luks1_vault::{ActivationFlags, CryptDevice, KeyslotSelector};
//! use std::path::Path;
//!
//! let mut device = CryptDevice::init(Path::new("/dev/sdb1"))?;
//! device.load(None)?;
//! device.activate_by_passphrase(Some("data"), KeyslotSelector::Any, b"passphrase", ActivationFlags::READ_ONLY)?;
//! # Ok::<(), luks1_vault::LuksError>(())
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod volume;

// Re-export commonly used types
pub use config::{KdfConfig, LUKS1_TYPE, LUKS_NUMKEYS, LUKS_STRIPES};
pub use crypto::kdf::Pbkdf2Kdf;
pub use crypto::registry::{DefaultRegistry, HashAlgorithm, PrimitiveRegistry};
pub use crypto::{KeyDerivation, SectorCipher};
pub use error::{LuksError, Result};
pub use storage::{BlockDevice, FileDevice, MemoryDevice};
pub use volume::{
    ActivationFlags, ActiveMapping, Backends, CryptDevice, DmsetupMapper, GenericParams,
    HeaderFormat, HeaderInfo, KeyslotSelector, Luks1Header, Luks1Params, MappingFacility, MappingRequest,
    MasterKey, MemoryMapper, SlotState,
};
