// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! luks1ctl - LUKS1 volume management
//!
//! # Usage
//!
//! ```bash
//! # Format a device and enroll the first passphrase
//! luks1ctl format /dev/sdb1 --key-size 512
//!
//! # Open it as /dev/mapper/secret
//! luks1ctl open /dev/sdb1 secret
//!
//! # Add, change and remove passphrases
//! luks1ctl add-key /dev/sdb1 --slot 1
//! luks1ctl change-key /dev/sdb1 --slot 1
//! luks1ctl kill-slot /dev/sdb1 1
//!
//! # Inspect the header
//! luks1ctl dump /dev/sdb1
//!
//! luks1ctl close secret
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use clap::{Parser, Subcommand};
use luks1_vault::{
    ActivationFlags, Backends, CryptDevice, GenericParams, KdfConfig, KeyslotSelector,
    Luks1Params,
};
use rpassword::prompt_password;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

/// LUKS1 volume management
#[derive(Parser)]
#[command(name = "luks1ctl")]
#[command(author = "Tesseract Vault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Format, unlock and manage keyslots of LUKS1 volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new LUKS1 header and enroll a passphrase in slot 0
    Format {
        /// Device or image file
        device: PathBuf,

        /// Cipher name
        #[arg(long, default_value = "aes")]
        cipher: String,

        /// Cipher mode
        #[arg(long, default_value = "xts-plain64")]
        mode: String,

        /// Volume key size in bits
        #[arg(long, default_value = "512")]
        key_size: usize,

        /// Hash for PBKDF2 and anti-forensic diffusion
        #[arg(long, default_value = "sha256")]
        hash: String,

        /// Target keyslot unlock time in milliseconds
        #[arg(long, default_value = "2000")]
        iter_time: u64,

        /// Payload alignment in 512-byte sectors
        #[arg(long, default_value = "2048")]
        align: u64,
    },

    /// Add a passphrase, unlocking with an existing one
    AddKey {
        /// Device or image file
        device: PathBuf,

        /// Keyslot to fill (lowest free slot if omitted)
        #[arg(long)]
        slot: Option<usize>,

        /// Target keyslot unlock time in milliseconds
        #[arg(long, default_value = "2000")]
        iter_time: u64,
    },

    /// Replace the passphrase in a keyslot
    ChangeKey {
        /// Device or image file
        device: PathBuf,

        /// Keyslot holding the old passphrase
        #[arg(long)]
        slot: usize,

        /// Keyslot to receive the new passphrase (defaults to --slot)
        #[arg(long)]
        new_slot: Option<usize>,

        /// Target keyslot unlock time in milliseconds
        #[arg(long, default_value = "2000")]
        iter_time: u64,
    },

    /// Wipe a keyslot
    KillSlot {
        /// Device or image file
        device: PathBuf,

        /// Keyslot to wipe
        slot: usize,
    },

    /// Unlock a volume and create a decrypted mapping
    Open {
        /// Device or image file
        device: PathBuf,

        /// Mapping name
        name: String,

        /// Only try this keyslot
        #[arg(long)]
        slot: Option<usize>,

        /// Create a read-only mapping
        #[arg(long)]
        readonly: bool,

        /// Pass discard requests through to the device
        #[arg(long)]
        allow_discards: bool,
    },

    /// Remove a decrypted mapping
    Close {
        /// Mapping name
        name: String,
    },

    /// Print the header as JSON
    Dump {
        /// Device or image file
        device: PathBuf,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match run_command(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_command(cmd: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        Commands::Format {
            device,
            cipher,
            mode,
            key_size,
            hash,
            iter_time,
            align,
        } => cmd_format(device, &cipher, &mode, key_size, &hash, iter_time, align),
        Commands::AddKey {
            device,
            slot,
            iter_time,
        } => cmd_add_key(device, slot, iter_time),
        Commands::ChangeKey {
            device,
            slot,
            new_slot,
            iter_time,
        } => cmd_change_key(device, slot, new_slot.unwrap_or(slot), iter_time),
        Commands::KillSlot { device, slot } => cmd_kill_slot(device, slot),
        Commands::Open {
            device,
            name,
            slot,
            readonly,
            allow_discards,
        } => cmd_open(device, &name, slot, readonly, allow_discards),
        Commands::Close { name } => cmd_close(&name),
        Commands::Dump { device } => cmd_dump(device),
    }
}

fn backends(iter_time: u64) -> Backends {
    let defaults = KdfConfig::default();
    Backends::default().kdf(KdfConfig::new(iter_time, defaults.digest_time_ms))
}

fn selector(slot: Option<usize>) -> KeyslotSelector {
    slot.map_or(KeyslotSelector::Any, KeyslotSelector::Slot)
}

fn confirm_yes() -> Result<(), Box<dyn std::error::Error>> {
    eprint!("Type uppercase YES to continue: ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    if answer.trim_end() != "YES" {
        return Err("Aborted".into());
    }
    Ok(())
}

fn prompt_new_passphrase(label: &str) -> Result<Zeroizing<String>, Box<dyn std::error::Error>> {
    let pass = Zeroizing::new(prompt_password(format!("Enter {}: ", label))?);
    let confirm = Zeroizing::new(prompt_password(format!("Verify {}: ", label))?);

    if *pass != *confirm {
        return Err("Passphrases do not match".into());
    }
    if pass.is_empty() {
        return Err("Passphrase cannot be empty".into());
    }
    Ok(pass)
}

fn cmd_format(
    device: PathBuf,
    cipher: &str,
    mode: &str,
    key_size: usize,
    hash: &str,
    iter_time: u64,
    align: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    if key_size % 8 != 0 {
        return Err(format!("Key size must be a multiple of 8 bits, got {}", key_size).into());
    }

    eprintln!("WARNING: this will overwrite data on {} irrevocably.", device.display());
    confirm_yes()?;

    let pass = prompt_new_passphrase("passphrase")?;

    let mut ctx = CryptDevice::init_with(&device, backends(iter_time))?;
    let luks1 = Luks1Params {
        hash: hash.to_string(),
        data_alignment: align,
    };
    ctx.format(&luks1, &GenericParams::new(cipher, mode, key_size / 8))?;
    let slot = ctx.keyslot_add_by_volume_key(KeyslotSelector::Slot(0), None, pass.as_bytes())?;

    eprintln!(
        "Formatted {} (UUID {}), passphrase in key slot {}",
        device.display(),
        ctx.uuid().unwrap_or("-"),
        slot
    );
    Ok(())
}

fn cmd_add_key(
    device: PathBuf,
    slot: Option<usize>,
    iter_time: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = CryptDevice::init_with(&device, backends(iter_time))?;
    ctx.load(None)?;

    let existing = Zeroizing::new(prompt_password("Enter any existing passphrase: ")?);
    let new_pass = prompt_new_passphrase("new passphrase")?;

    let used = ctx.keyslot_add_by_passphrase(selector(slot), existing.as_bytes(), new_pass.as_bytes())?;
    eprintln!("Key slot {} created.", used);
    Ok(())
}

fn cmd_change_key(
    device: PathBuf,
    slot: usize,
    new_slot: usize,
    iter_time: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = CryptDevice::init_with(&device, backends(iter_time))?;
    ctx.load(None)?;

    let old_pass = Zeroizing::new(prompt_password(format!("Enter passphrase for slot {}: ", slot))?);
    let new_pass = prompt_new_passphrase("new passphrase")?;

    let used = ctx.keyslot_change_by_passphrase(slot, new_slot, old_pass.as_bytes(), new_pass.as_bytes())?;
    eprintln!("Key slot {} changed.", used);
    Ok(())
}

fn cmd_kill_slot(device: PathBuf, slot: usize) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = CryptDevice::init_with(&device, Backends::default())?;
    ctx.load(None)?;

    let remaining = ctx
        .header()
        .map(|h| h.active_count())
        .unwrap_or_default();
    if remaining <= 1 {
        eprintln!("WARNING: this is the last key slot; the volume will become inaccessible.");
        confirm_yes()?;
    }

    ctx.keyslot_destroy(slot)?;
    eprintln!("Key slot {} wiped.", slot);
    Ok(())
}

fn cmd_open(
    device: PathBuf,
    name: &str,
    slot: Option<usize>,
    readonly: bool,
    allow_discards: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = CryptDevice::init_with(&device, Backends::default())?;
    ctx.load(None)?;

    let mut flags = ActivationFlags::NONE;
    if readonly {
        flags = flags | ActivationFlags::READ_ONLY;
    }
    if allow_discards {
        flags = flags | ActivationFlags::ALLOW_DISCARDS;
    }

    let pass = Zeroizing::new(prompt_password(format!("Enter passphrase for {}: ", device.display()))?);
    let used = ctx.activate_by_passphrase(Some(name), selector(slot), pass.as_bytes(), flags)?;
    ctx.lock();

    eprintln!("Opened {} as /dev/mapper/{} (key slot {}).", device.display(), name, used);
    Ok(())
}

fn cmd_close(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = CryptDevice::init_by_name(name)?;
    ctx.deactivate(name)?;
    eprintln!("Closed {}.", name);
    Ok(())
}

fn cmd_dump(device: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = CryptDevice::init_with(&device, Backends::default())?;
    ctx.load(None)?;
    println!("{}", serde_json::to_string_pretty(&ctx.dump()?)?);
    Ok(())
}
