//! TNG Base EEPROM image tool.
//!
//! Decodes and builds identity EEPROM images offline, with the same codec the
//! init program uses on the board.
//!
//! # Usage
//!
//! ```bash
//! # Show the fields of a dumped image
//! tng-eeprom decode eeprom.bin
//!
//! # Build a version 1 image for programming
//! tng-eeprom encode --date 2020-08-27 --uid Xy9Za --hostname tng-base-xy9za \
//!     --encrypted-password '$6$...' --ethernet-config lan7500.bin -o eeprom.bin
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use tng_init::eeprom::format::ETHERNET_CONFIG_LENGTH;
use tng_init::eeprom::{EepromRecord, ProductionDate};

#[derive(Parser)]
#[command(name = "tng-eeprom")]
#[command(author, version, about = "TNG Base identity EEPROM tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an image and print its fields
    Decode {
        /// EEPROM image file
        image: PathBuf,
    },

    /// Build a version 1 image
    Encode {
        /// Production date, YYYY-MM-DD
        #[arg(long)]
        date: ProductionDate,

        /// Unique id (up to 6 characters)
        #[arg(long)]
        uid: String,

        /// Hostname (up to 64 characters)
        #[arg(long)]
        hostname: String,

        /// crypt(3) hash of the device password
        #[arg(long)]
        encrypted_password: String,

        /// 256-byte Ethernet controller configuration
        #[arg(long)]
        ethernet_config: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Decode { image } => cmd_decode(&image),
        Commands::Encode {
            date,
            uid,
            hostname,
            encrypted_password,
            ethernet_config,
            output,
        } => cmd_encode(
            date,
            uid,
            hostname,
            encrypted_password,
            &ethernet_config,
            &output,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn cmd_decode(image: &Path) -> Result<()> {
    let bytes = fs::read(image).with_context(|| format!("could not read {}", image.display()))?;
    let record = EepromRecord::decode(&bytes)
        .with_context(|| format!("invalid image {}", image.display()))?;

    println!("data version:       {}", record.version);
    println!("production date:    {}", record.production_date);
    println!("uid:                {}", record.uid_str());
    println!("hostname:           {}", record.hostname_str());
    println!(
        "encrypted password: {}",
        String::from_utf8_lossy(&record.encrypted_password)
    );
    println!(
        "ethernet config:    {} bytes, first byte 0x{:02X}",
        record.ethernet_config.len(),
        record.ethernet_config[0]
    );

    Ok(())
}

fn cmd_encode(
    date: ProductionDate,
    uid: String,
    hostname: String,
    encrypted_password: String,
    config_path: &Path,
    output: &Path,
) -> Result<()> {
    let blob = fs::read(config_path)
        .with_context(|| format!("could not read {}", config_path.display()))?;
    let Ok(ethernet_config) = <[u8; ETHERNET_CONFIG_LENGTH]>::try_from(blob.as_slice()) else {
        bail!(
            "Ethernet config must be exactly {} bytes, {} is {} bytes",
            ETHERNET_CONFIG_LENGTH,
            config_path.display(),
            blob.len()
        );
    };

    let record = EepromRecord {
        version: 1,
        production_date: date,
        uid: uid.into_bytes(),
        hostname: hostname.into_bytes(),
        encrypted_password: encrypted_password.into_bytes(),
        ethernet_config,
    };

    let image = record.encode()?;
    fs::write(output, &image).with_context(|| format!("could not write {}", output.display()))?;

    println!("Wrote {} ({} bytes)", output.display(), image.len());
    Ok(())
}
