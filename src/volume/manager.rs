// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Activation controller backends.
//!
//! A mapping facility exposes the decrypted payload of a LUKS1 device as a
//! named block device. The device context only talks to the
//! [`MappingFacility`] trait; two implementations are provided:
//!
//! - [`MemoryMapper`]: an in-process registry of named mappings, used by
//!   tests and by embedders that do their own sector I/O.
//! - [`DmsetupMapper`]: Linux device-mapper `crypt` targets driven through
//!   the `dmsetup` tool.

use crate::error::{LuksError, Result};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Activation flags, compatible with the cryptsetup bit values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ActivationFlags(u32);

impl ActivationFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Expose the mapping read-only.
    pub const READ_ONLY: Self = Self(1 << 0);
    /// Pass discard requests through to the backing device.
    pub const ALLOW_DISCARDS: Self = Self(1 << 3);

    /// Raw bit value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from raw bits, dropping unknown ones.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & (Self::READ_ONLY.0 | Self::ALLOW_DISCARDS.0))
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ActivationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Everything a facility needs to create one mapping.
pub struct MappingRequest<'a> {
    /// Mapping name, unique in the facility's namespace.
    pub name: &'a str,
    /// Kernel-style cipher spec, e.g. `aes-xts-plain64`.
    pub cipher_spec: String,
    /// Volume key.
    pub key: &'a [u8],
    /// Backing device identity (path).
    pub backing: String,
    /// First payload sector on the backing device.
    pub payload_offset: u64,
    /// Length of the mapping in sectors.
    pub size_sectors: u64,
    /// Activation flags.
    pub flags: ActivationFlags,
    /// Volume UUID, if the header carries one.
    pub uuid: Option<String>,
}

impl std::fmt::Debug for MappingRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingRequest")
            .field("name", &self.name)
            .field("cipher_spec", &self.cipher_spec)
            .field("key", &"[REDACTED]")
            .field("backing", &self.backing)
            .field("payload_offset", &self.payload_offset)
            .field("size_sectors", &self.size_sectors)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Description of an active mapping, as reported by a facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMapping {
    /// Mapping name.
    pub name: String,
    /// Kernel-style cipher spec.
    pub cipher_spec: String,
    /// Backing device path.
    pub backing: String,
    /// First payload sector on the backing device.
    pub payload_offset: u64,
    /// Length in sectors.
    pub size_sectors: u64,
    /// Whether the mapping is read-only.
    pub read_only: bool,
    /// Volume UUID, when the facility records it.
    pub uuid: Option<String>,
}

/// Capability interface to the external block mapping subsystem.
pub trait MappingFacility: Send + Sync {
    /// Creates a named decrypted view.
    ///
    /// Fails with `MappingExists` if the name is taken.
    fn activate(&self, request: &MappingRequest<'_>) -> Result<()>;

    /// Removes a named view.
    ///
    /// Fails with `MappingNotFound` if absent and `MappingBusy` if open.
    fn deactivate(&self, name: &str) -> Result<()>;

    /// Looks up a named view. Fails with `MappingNotFound` if absent.
    fn query(&self, name: &str) -> Result<ActiveMapping>;
}

struct MappedEntry {
    mapping: ActiveMapping,
    key: Zeroizing<Vec<u8>>,
    holders: usize,
}

#[derive(Default)]
struct MapperState {
    mappings: HashMap<String, MappedEntry>,
    pending_failure: Option<(i32, String)>,
}

/// In-process mapping registry.
///
/// Clones share state, so a mapping created through one device context is
/// visible to a later [`CryptDevice::init_by_name`](crate::CryptDevice::init_by_name)
/// that was given a clone.
#[derive(Clone, Default)]
pub struct MemoryMapper {
    state: Arc<Mutex<MapperState>>,
}

impl MemoryMapper {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MapperState>> {
        self.state.lock().map_err(|_| LuksError::MappingFailed {
            code: -5,
            reason: "mapping registry lock poisoned".into(),
        })
    }

    /// Returns true if `name` is active.
    pub fn is_active(&self, name: &str) -> bool {
        self.lock().map(|s| s.mappings.contains_key(name)).unwrap_or(false)
    }

    /// Names of all active mappings, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|s| s.mappings.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Takes a reference on a mapping, as an open file handle would.
    pub fn hold(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        let entry = state
            .mappings
            .get_mut(name)
            .ok_or_else(|| LuksError::MappingNotFound(name.to_string()))?;
        entry.holders += 1;
        Ok(())
    }

    /// Drops a reference taken with [`MemoryMapper::hold`].
    pub fn release(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        let entry = state
            .mappings
            .get_mut(name)
            .ok_or_else(|| LuksError::MappingNotFound(name.to_string()))?;
        entry.holders = entry.holders.saturating_sub(1);
        Ok(())
    }

    /// Key a mapping was created with.
    pub fn mapped_key(&self, name: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.lock()
            .ok()?
            .mappings
            .get(name)
            .map(|entry| entry.key.clone())
    }

    /// Makes the next `activate` fail with `MappingFailed { code, reason }`.
    pub fn fail_next_activation(&self, code: i32, reason: &str) -> Result<()> {
        self.lock()?.pending_failure = Some((code, reason.to_string()));
        Ok(())
    }
}

impl MappingFacility for MemoryMapper {
    fn activate(&self, request: &MappingRequest<'_>) -> Result<()> {
        if request.name.is_empty() {
            return Err(LuksError::InvalidParameter("mapping name is empty".into()));
        }
        let mut state = self.lock()?;
        if let Some((code, reason)) = state.pending_failure.take() {
            return Err(LuksError::MappingFailed { code, reason });
        }
        if state.mappings.contains_key(request.name) {
            return Err(LuksError::MappingExists(request.name.to_string()));
        }

        let mapping = ActiveMapping {
            name: request.name.to_string(),
            cipher_spec: request.cipher_spec.clone(),
            backing: request.backing.clone(),
            payload_offset: request.payload_offset,
            size_sectors: request.size_sectors,
            read_only: request.flags.contains(ActivationFlags::READ_ONLY),
            uuid: request.uuid.clone(),
        };
        state.mappings.insert(
            request.name.to_string(),
            MappedEntry {
                mapping,
                key: Zeroizing::new(request.key.to_vec()),
                holders: 0,
            },
        );
        Ok(())
    }

    fn deactivate(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        match state.mappings.get(name) {
            None => Err(LuksError::MappingNotFound(name.to_string())),
            Some(entry) if entry.holders > 0 => Err(LuksError::MappingBusy(name.to_string())),
            Some(_) => {
                state.mappings.remove(name);
                Ok(())
            }
        }
    }

    fn query(&self, name: &str) -> Result<ActiveMapping> {
        self.lock()?
            .mappings
            .get(name)
            .map(|entry| entry.mapping.clone())
            .ok_or_else(|| LuksError::MappingNotFound(name.to_string()))
    }
}

/// Device-mapper backend using the `dmsetup` tool.
///
/// Tables are passed on stdin so the key never appears in the process
/// argument list.
#[derive(Debug, Clone)]
pub struct DmsetupMapper {
    program: String,
}

impl Default for DmsetupMapper {
    fn default() -> Self {
        Self {
            program: "dmsetup".to_string(),
        }
    }
}

impl DmsetupMapper {
    /// Uses `dmsetup` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an explicit `dmsetup` binary.
    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Builds the device-mapper `crypt` table line.
    pub fn crypt_table(request: &MappingRequest<'_>) -> Zeroizing<String> {
        let key_hex = Zeroizing::new(hex::encode(request.key));
        let mut table = Zeroizing::new(format!(
            "0 {} crypt {} {} 0 {} {}",
            request.size_sectors,
            request.cipher_spec,
            key_hex.as_str(),
            request.backing,
            request.payload_offset
        ));
        if request.flags.contains(ActivationFlags::ALLOW_DISCARDS) {
            table.push_str(" 1 allow_discards");
        }
        table.push('\n');
        table
    }

    /// Splits a table line back into an [`ActiveMapping`].
    pub fn parse_table(name: &str, table: &str) -> Result<ActiveMapping> {
        let fields: Vec<&str> = table.split_whitespace().collect();
        if fields.len() < 8 || fields[2] != "crypt" {
            return Err(LuksError::MappingFailed {
                code: -22,
                reason: format!("{} is not a crypt mapping", name),
            });
        }
        let number = |s: &str| {
            s.parse::<u64>().map_err(|_| LuksError::MappingFailed {
                code: -22,
                reason: format!("unparsable table for {}: {}", name, s),
            })
        };
        Ok(ActiveMapping {
            name: name.to_string(),
            cipher_spec: fields[3].to_string(),
            backing: resolve_backing(fields[6]),
            payload_offset: number(fields[7])?,
            size_sectors: number(fields[1])?,
            read_only: false,
            uuid: None,
        })
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>, name: &str) -> Result<String> {
        use std::process::{Command, Stdio};

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LuksError::MappingFailed {
                code: -2,
                reason: format!("cannot run {}: {}", self.program, e),
            })?;

        if let Some(input) = stdin {
            feed_stdin(&mut child, input)?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Err(classify_failure(name, output.status.code(), stderr.trim()))
    }
}

/// Writes `input` to the child's stdin and closes it. On failure the child
/// is killed and reaped before the error is returned.
fn feed_stdin(child: &mut std::process::Child, input: &[u8]) -> Result<()> {
    use std::io::Write;

    let Some(mut pipe) = child.stdin.take() else {
        return Ok(());
    };
    if let Err(e) = pipe.write_all(input) {
        drop(pipe);
        if let Err(kill) = child.kill() {
            tracing::debug!(error = %kill, "child already exited");
        }
        child.wait()?;
        return Err(e.into());
    }
    Ok(())
}

fn classify_failure(name: &str, status: Option<i32>, stderr: &str) -> LuksError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such device") || lower.contains("not found") {
        LuksError::MappingNotFound(name.to_string())
    } else if lower.contains("busy") {
        LuksError::MappingBusy(name.to_string())
    } else if lower.contains("already exists") {
        LuksError::MappingExists(name.to_string())
    } else {
        LuksError::MappingFailed {
            code: status.map(|c| -c.abs()).unwrap_or(-5),
            reason: stderr.to_string(),
        }
    }
}

/// Turns a `major:minor` table reference into a `/dev` path via sysfs.
fn resolve_backing(device: &str) -> String {
    if !device.contains(':') || device.starts_with('/') {
        return device.to_string();
    }
    let uevent = format!("/sys/dev/block/{}/uevent", device);
    std::fs::read_to_string(uevent)
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find_map(|line| line.strip_prefix("DEVNAME="))
                .map(|dev| format!("/dev/{}", dev))
        })
        .unwrap_or_else(|| device.to_string())
}

impl MappingFacility for DmsetupMapper {
    fn activate(&self, request: &MappingRequest<'_>) -> Result<()> {
        if request.size_sectors == 0 {
            return Err(LuksError::InvalidParameter("payload area is empty".into()));
        }
        // create on a taken name reports EBUSY, not EEXIST
        if self.run(&["info", request.name], None, request.name).is_ok() {
            return Err(LuksError::MappingExists(request.name.to_string()));
        }
        let table = Self::crypt_table(request);
        let dm_uuid = request
            .uuid
            .as_ref()
            .map(|uuid| format!("CRYPT-LUKS1-{}-{}", uuid.replace('-', ""), request.name));

        let mut args = vec!["create", request.name];
        if let Some(ref dm_uuid) = dm_uuid {
            args.extend(["--uuid", dm_uuid.as_str()]);
        }
        if request.flags.contains(ActivationFlags::READ_ONLY) {
            args.push("--readonly");
        }
        self.run(&args, Some(table.as_bytes()), request.name)?;
        tracing::debug!(name = request.name, "dmsetup mapping created");
        Ok(())
    }

    fn deactivate(&self, name: &str) -> Result<()> {
        self.run(&["remove", name], None, name)?;
        Ok(())
    }

    fn query(&self, name: &str) -> Result<ActiveMapping> {
        let table = self.run(&["table", name], None, name)?;
        let mut mapping = Self::parse_table(name, &table)?;

        let info = self.run(&["info", name], None, name)?;
        for line in info.lines() {
            if let Some(state) = line.strip_prefix("State:") {
                mapping.read_only = state.contains("READ-ONLY");
            } else if let Some(uuid) = line.strip_prefix("UUID:") {
                mapping.uuid = Some(uuid.trim().to_string()).filter(|u| !u.is_empty());
            }
        }
        Ok(mapping)
    }
}
