//! Ethernet controller provisioning.
//!
//! The on-board USB Ethernet controller keeps its configuration (MAC address
//! among others) in a small EEPROM behind ethtool. A blank or factory part is
//! programmed once from the identity record; a configured part starts with
//! [`CONFIGURED_MARKER`] and is left alone.

mod ethtool;

pub use ethtool::{EthtoolChannel, IFNAMSIZ};

use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::info;

use crate::config::{BootConfig, ETHERNET_SETTLE_DELAY};
use crate::eeprom::format::ETHERNET_CONFIG_LENGTH;
use crate::eeprom::EepromRecord;

/// First byte of a configured controller EEPROM.
pub const CONFIGURED_MARKER: u8 = 0xA5;

/// Write-enable magic for the controller EEPROM.
pub const WRITE_MAGIC: u32 = 0x7500;

/// Register space holding the controller configuration.
pub trait ConfigRegisters {
    /// Fill `buf` from `offset`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset` in one transaction.
    fn write(&mut self, offset: u32, magic: u32, data: &[u8]) -> io::Result<()>;
}

/// What [`configure`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthernetOutcome {
    Configured,
    AlreadyConfigured,
}

/// Name of the only network interface under `device`'s `net/` directory.
pub fn discover_interface(device: &Path) -> Result<String> {
    info!("looking up Ethernet device name");

    let net = device.join("net");
    let entries = fs::read_dir(&net)
        .with_context(|| {
            format!(
                "could not open net/ subdirectory of Ethernet device {}",
                device.display()
            )
        })?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| {
            format!(
                "could not read net/ subdirectory of Ethernet device {}",
                device.display()
            )
        })?;

    let [entry] = entries.as_slice() else {
        bail!("expected exactly one entry in {}, found {}", net.display(), entries.len());
    };

    let name = entry.file_name().to_string_lossy().into_owned();

    let file_type = entry
        .file_type()
        .with_context(|| format!("could not get type of {}", entry.path().display()))?;
    if !file_type.is_dir() {
        bail!("directory entry {} of {} has unexpected type", name, net.display());
    }

    if name.len() >= IFNAMSIZ {
        bail!("Ethernet device name {} is too long: {} > {}", name, name.len(), IFNAMSIZ - 1);
    }

    info!("found Ethernet device name: {}", name);
    Ok(name)
}

/// Program `config` into `registers` unless already configured, then verify.
pub fn configure<R: ConfigRegisters>(
    registers: &mut R,
    config: &[u8; ETHERNET_CONFIG_LENGTH],
    settle: Duration,
) -> Result<EthernetOutcome> {
    info!("reading first Ethernet config byte");

    let mut first = [0u8; 1];
    registers
        .read(0, &mut first)
        .context("could not read first Ethernet config byte")?;

    if first[0] == CONFIGURED_MARKER {
        info!("Ethernet already configured, skipping Ethernet configuration");
        return Ok(EthernetOutcome::AlreadyConfigured);
    }

    info!("writing Ethernet config");
    registers
        .write(0, WRITE_MAGIC, config)
        .context("could not write Ethernet config")?;

    thread::sleep(settle);

    info!("validating Ethernet config");
    let mut readback = [0u8; ETHERNET_CONFIG_LENGTH];
    registers
        .read(0, &mut readback)
        .context("could not read Ethernet config")?;

    if readback != *config {
        bail!("Ethernet config validation failed");
    }

    Ok(EthernetOutcome::Configured)
}

/// Configure the board's Ethernet controller from `record`.
pub fn provision(config: &BootConfig, record: &EepromRecord) -> Result<EthernetOutcome> {
    let ifname = discover_interface(&config.ethernet_device)?;
    let mut channel = EthtoolChannel::open(&ifname)?;
    configure(&mut channel, &record.ethernet_config, ETHERNET_SETTLE_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// In-memory controller EEPROM.
    struct FakeRegisters {
        bytes: Vec<u8>,
        writes: usize,
        /// Bits the part fails to store
        stuck: u8,
    }

    impl FakeRegisters {
        fn new(first: u8) -> Self {
            let mut bytes = vec![0xFF; ETHERNET_CONFIG_LENGTH];
            bytes[0] = first;
            Self {
                bytes,
                writes: 0,
                stuck: 0,
            }
        }
    }

    impl ConfigRegisters for FakeRegisters {
        fn read(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<()> {
            let start = offset as usize;
            buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
            Ok(())
        }

        fn write(&mut self, offset: u32, magic: u32, data: &[u8]) -> io::Result<()> {
            if magic != WRITE_MAGIC {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.writes += 1;
            let start = offset as usize;
            for (slot, byte) in self.bytes[start..start + data.len()].iter_mut().zip(data) {
                *slot = byte & !self.stuck;
            }
            Ok(())
        }
    }

    fn blob() -> [u8; ETHERNET_CONFIG_LENGTH] {
        let mut blob = [0u8; ETHERNET_CONFIG_LENGTH];
        for (i, byte) in blob.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(31);
        }
        blob[0] = CONFIGURED_MARKER;
        blob
    }

    #[test]
    fn test_configured_part_is_not_written() -> Result<()> {
        let mut registers = FakeRegisters::new(CONFIGURED_MARKER);

        assert_eq!(
            configure(&mut registers, &blob(), Duration::ZERO)?,
            EthernetOutcome::AlreadyConfigured
        );
        assert_eq!(registers.writes, 0);
        Ok(())
    }

    #[test]
    fn test_blank_part_is_programmed() -> Result<()> {
        let mut registers = FakeRegisters::new(0xFF);

        assert_eq!(
            configure(&mut registers, &blob(), Duration::ZERO)?,
            EthernetOutcome::Configured
        );
        assert_eq!(registers.writes, 1);
        assert_eq!(registers.bytes, blob().to_vec());
        Ok(())
    }

    #[test]
    fn test_readback_mismatch_is_an_error() {
        let mut registers = FakeRegisters::new(0xFF);
        registers.stuck = 0x80;

        let err = configure(&mut registers, &blob(), Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "Ethernet config validation failed");
        assert_eq!(registers.writes, 1);
    }

    #[test]
    fn test_discover_single_interface() -> Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("net/eth0"))?;

        assert_eq!(discover_interface(dir.path())?, "eth0");
        Ok(())
    }

    #[test]
    fn test_discover_rejects_unexpected_topology() -> Result<()> {
        let dir = tempdir()?;
        assert!(discover_interface(dir.path()).is_err());

        fs::create_dir_all(dir.path().join("net"))?;
        assert!(discover_interface(dir.path()).is_err());

        fs::create_dir(dir.path().join("net/eth0"))?;
        fs::create_dir(dir.path().join("net/eth1"))?;
        let err = discover_interface(dir.path()).unwrap_err();
        assert!(err.to_string().contains("found 2"));
        Ok(())
    }

    #[test]
    fn test_discover_rejects_files_and_long_names() -> Result<()> {
        let dir = tempdir()?;
        fs::create_dir(dir.path().join("net"))?;
        fs::write(dir.path().join("net/eth0"), b"")?;
        assert!(discover_interface(dir.path()).is_err());

        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("net/enxb827ebabcdef0"))?;
        let err = discover_interface(dir.path()).unwrap_err();
        assert!(err.to_string().contains("too long"));
        Ok(())
    }
}
