// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Staged header commit.
//!
//! The LUKS1 phdr occupies the first 592 bytes of the device and keyslot
//! material begins at 4096, leaving bytes 2048..4096 unused. A new header
//! is first written there as a checksummed staging record, then copied to
//! the primary location, then the record is cleared. Each step is fenced
//! with a sync:
//!
//! ```text
//! crash before (1) completes  -> staging invalid, primary old
//! crash between (1) and (3)   -> staging valid, rolled forward on load
//! crash after (3)             -> primary new
//! ```

use super::{wipe_zero, BlockDevice};
use crate::error::{LuksError, Result};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Byte offset of the staging record.
pub const STAGING_OFFSET: u64 = 2048;

/// Bytes available to the staging record.
pub const STAGING_CAPACITY: usize = 2048;

const STAGING_MAGIC: [u8; 8] = *b"L1STAGE\0";
const PREFIX_LEN: usize = 8 + 4 + 32;

fn encode_record(header: &[u8]) -> Result<Vec<u8>> {
    if PREFIX_LEN + header.len() > STAGING_CAPACITY {
        return Err(LuksError::InvalidParameter(format!(
            "header of {} bytes does not fit the staging area",
            header.len()
        )));
    }
    let mut record = Vec::with_capacity(PREFIX_LEN + header.len());
    record.extend_from_slice(&STAGING_MAGIC);
    record.extend_from_slice(&(header.len() as u32).to_be_bytes());
    record.extend_from_slice(&Sha256::digest(header));
    record.extend_from_slice(header);
    Ok(record)
}

/// Durably replaces the header at offset 0 with `header`.
///
/// # Errors
///
/// Any write or sync failure is returned as is. After a failure the device
/// holds either the old header, or a staging record that [`recover`]
/// will roll forward.
pub fn commit_header(device: &mut dyn BlockDevice, header: &[u8]) -> Result<()> {
    let record = encode_record(header)?;

    device.write_at(STAGING_OFFSET, &record)?;
    device.sync()?;

    device.write_at(0, header)?;
    device.sync()?;

    wipe_zero(device, STAGING_OFFSET, record.len() as u64)?;
    device.sync()?;
    Ok(())
}

/// Rolls a pending staged header forward.
///
/// Returns the header bytes now at offset 0 when a valid record was found.
/// An invalid record is cleared and ignored.
pub fn recover(device: &mut dyn BlockDevice) -> Result<Option<Vec<u8>>> {
    if device.size()? < STAGING_OFFSET + STAGING_CAPACITY as u64 {
        return Ok(None);
    }

    let mut prefix = [0u8; PREFIX_LEN];
    device.read_at(STAGING_OFFSET, &mut prefix)?;
    if prefix[..8] != STAGING_MAGIC {
        return Ok(None);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&prefix[8..12]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || PREFIX_LEN + len > STAGING_CAPACITY {
        tracing::warn!(len, "discarding staging record with impossible length");
        discard(device, STAGING_CAPACITY)?;
        return Ok(None);
    }

    let mut header = vec![0u8; len];
    device.read_at(STAGING_OFFSET + PREFIX_LEN as u64, &mut header)?;
    let checksum = Sha256::digest(&header);
    if !bool::from(checksum.as_slice().ct_eq(&prefix[12..])) {
        tracing::warn!("discarding torn staging record");
        discard(device, PREFIX_LEN + len)?;
        return Ok(None);
    }

    tracing::warn!(
        device = %device.identity(),
        "interrupted header update found, rolling forward"
    );
    device.write_at(0, &header)?;
    device.sync()?;
    discard(device, PREFIX_LEN + len)?;
    Ok(Some(header))
}

fn discard(device: &mut dyn BlockDevice, len: usize) -> Result<()> {
    wipe_zero(device, STAGING_OFFSET, len as u64)?;
    device.sync()
}
