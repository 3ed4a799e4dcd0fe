// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Error types for the LUKS1 engine.
//!
//! Every fallible operation returns [`LuksError`]. The variants are the
//! primary contract; [`LuksError::code`] maps them onto the negative errno
//! values that cryptsetup-style callers expect.

use thiserror::Error;

/// errno values used by the legacy numeric shim.
const EPERM: i32 = 1;
const EIO: i32 = 5;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;

/// Main error type for all volume operations.
#[derive(Error, Debug)]
pub enum LuksError {
    /// Bad cipher/mode/hash name or key size passed to Format.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A primitive name the registry does not know.
    #[error("Unsupported primitive: {0}")]
    UnsupportedPrimitive(String),

    /// Magic bytes do not identify a LUKS header.
    #[error("Device is not a LUKS volume")]
    NotLuksHeader,

    /// LUKS header with a version other than 1.
    #[error("Unsupported LUKS version: {0}")]
    UnsupportedVersion(u16),

    /// Structural invariants of the header are violated.
    #[error("Corrupt LUKS header: {0}")]
    CorruptHeader(String),

    /// No keyslot accepted the passphrase.
    #[error("No key available with this passphrase")]
    PassphraseMismatch,

    /// A supplied volume key does not match the header digest.
    #[error("Volume key does not match the volume")]
    VolumeKeyMismatch,

    /// The operation needs a volume key but the context holds none.
    #[error("No volume key available in this context")]
    NoVolumeKey,

    /// Target keyslot is already active.
    #[error("Key slot {0} is already active")]
    SlotOccupied(usize),

    /// Keyslot index out of range.
    #[error("Invalid key slot index: {0} (must be < {max})", max = crate::config::LUKS_NUMKEYS)]
    InvalidSlot(usize),

    /// Keyslot is not active.
    #[error("Key slot {0} is not active")]
    SlotInactive(usize),

    /// Every keyslot is active.
    #[error("All key slots are full")]
    NoKeyslotAvailable,

    /// Stored key material no longer merges to the digested volume key.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// A mapping with this name already exists.
    #[error("Device mapping {0} already exists")]
    MappingExists(String),

    /// No mapping with this name exists.
    #[error("Device mapping {0} is not active")]
    MappingNotFound(String),

    /// Mapping is still referenced and cannot be removed.
    #[error("Device mapping {0} is still in use")]
    MappingBusy(String),

    /// Lower-level failure reported by the mapping facility.
    #[error("Mapping facility failed with code {code}: {reason}")]
    MappingFailed {
        /// Numeric code from the facility (negative errno style).
        code: i32,
        /// Facility diagnostic text.
        reason: String,
    },

    /// The context has no loaded header.
    #[error("No LUKS header loaded in this context")]
    NotLoaded,

    /// I/O error on the backing device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header encoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl LuksError {
    /// Negative errno value for callers that speak the numeric contract.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter(_)
            | Self::UnsupportedPrimitive(_)
            | Self::NotLuksHeader
            | Self::UnsupportedVersion(_)
            | Self::CorruptHeader(_)
            | Self::SlotOccupied(_)
            | Self::InvalidSlot(_)
            | Self::SlotInactive(_)
            | Self::NoKeyslotAvailable
            | Self::NoVolumeKey
            | Self::NotLoaded => -EINVAL,
            Self::PassphraseMismatch | Self::VolumeKeyMismatch => -EPERM,
            Self::IntegrityError(_) | Self::Io(_) | Self::Serialization(_) => -EIO,
            Self::MappingExists(_) => -EEXIST,
            Self::MappingNotFound(_) => -ENODEV,
            Self::MappingBusy(_) => -EBUSY,
            Self::MappingFailed { code, .. } => *code,
        }
    }
}

/// Type alias for Results using LuksError.
pub type Result<T> = std::result::Result<T, LuksError>;
