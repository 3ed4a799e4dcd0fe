// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Block storage and crash-safe header writes.
//!
//! This module provides the [`BlockDevice`] abstraction the volume layer
//! reads and writes through, a file-backed and an in-memory implementation,
//! and the staged header commit in [`commit`].

pub mod commit;

use crate::error::{LuksError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::OsRng;
use rand::RngCore;

/// Byte-addressed access to a backing device.
///
/// Offsets are absolute from the start of the device. Writes are only
/// durable after [`BlockDevice::sync`] returns.
pub trait BlockDevice: Send {
    /// Fills `buf` from `offset`. Short reads are errors.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Durability fence for every preceding write.
    fn sync(&mut self) -> Result<()>;

    /// Device length in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Identity used for mapping tables and diagnostics.
    fn identity(&self) -> String;
}

/// Overwrites `len` bytes at `offset` with random data, in 64 KiB chunks.
pub fn wipe_random(device: &mut dyn BlockDevice, offset: u64, len: u64) -> Result<()> {
    const CHUNK: u64 = 64 * 1024;
    let mut buf = vec![0u8; CHUNK.min(len) as usize];
    let mut done = 0u64;
    while done < len {
        let n = CHUNK.min(len - done) as usize;
        OsRng
            .try_fill_bytes(&mut buf[..n])
            .map_err(|e| LuksError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        device.write_at(offset + done, &buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Overwrites `len` bytes at `offset` with zeros.
pub fn wipe_zero(device: &mut dyn BlockDevice, offset: u64, len: u64) -> Result<()> {
    const CHUNK: u64 = 64 * 1024;
    let buf = vec![0u8; CHUNK.min(len) as usize];
    let mut done = 0u64;
    while done < len {
        let n = CHUNK.min(len - done) as usize;
        device.write_at(offset + done, &buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// A regular file or block device node.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    /// Opens `path` for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or is not writable.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        // metadata().len() is zero for block device nodes
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    fn identity(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug)]
struct MemoryImage {
    data: Vec<u8>,
    writes_left: Option<usize>,
    syncs: usize,
    reads: Vec<u64>,
}

/// Shared in-memory device image.
///
/// Clones share the same image, so a test can keep a handle to inspect or
/// corrupt the bytes while a device context owns another.
/// [`MemoryDevice::fail_after_writes`] makes later writes fail, which
/// simulates a crash partway through a multi-write update.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    image: Arc<Mutex<MemoryImage>>,
    name: String,
}

impl MemoryDevice {
    /// Creates a zero-filled image of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_image(vec![0u8; size])
    }

    /// Wraps existing bytes.
    pub fn from_image(data: Vec<u8>) -> Self {
        Self {
            image: Arc::new(Mutex::new(MemoryImage {
                data,
                writes_left: None,
                syncs: 0,
                reads: Vec::new(),
            })),
            name: "memory".to_string(),
        }
    }

    /// Sets the identity reported to mapping facilities.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryImage>> {
        self.image.lock().map_err(|_| {
            LuksError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory device lock poisoned",
            ))
        })
    }

    /// Allows `n` more successful writes, then fails every write.
    /// `None` clears the limit.
    pub fn fail_after_writes(&self, n: Option<usize>) -> Result<()> {
        self.lock()?.writes_left = n;
        Ok(())
    }

    /// Copy of the current image.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.data.clone())
    }

    /// Overwrites bytes directly, bypassing the failure limit.
    pub fn poke(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut image = self.lock()?;
        let end = checked_range(offset as u64, data.len(), image.data.len())?;
        image.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Number of sync calls seen so far.
    pub fn sync_count(&self) -> Result<usize> {
        Ok(self.lock()?.syncs)
    }

    /// Start offsets of every read since the last call, oldest first.
    pub fn take_reads(&self) -> Result<Vec<u64>> {
        Ok(std::mem::take(&mut self.lock()?.reads))
    }
}

fn checked_range(offset: u64, len: usize, size: usize) -> Result<usize> {
    let start = usize::try_from(offset).map_err(|_| out_of_range(offset, len))?;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => Err(out_of_range(offset, len)),
    }
}

fn out_of_range(offset: u64, len: usize) -> LuksError {
    LuksError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("access of {} bytes at offset {} is past the end of the device", len, offset),
    ))
}

impl BlockDevice for MemoryDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut image = self.lock()?;
        let end = checked_range(offset, buf.len(), image.data.len())?;
        buf.copy_from_slice(&image.data[offset as usize..end]);
        image.reads.push(offset);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut image = self.lock()?;
        match image.writes_left {
            Some(0) => {
                return Err(LuksError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                )))
            }
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        let end = checked_range(offset, data.len(), image.data.len())?;
        image.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.lock()?.syncs += 1;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.lock()?.data.len() as u64)
    }

    fn identity(&self) -> String {
        self.name.clone()
    }
}
