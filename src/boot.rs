//! The boot sequence.
//!
//! ```text
//! 1. Mount /proc, read the kernel command line, mount /sys and /dev
//! 2. Mount the root device at the staging directory (retrying)
//! 3. Mount devtmpfs inside it
//! 4. Load clock modules, set the system clock from the RTC
//! 5. Load the I2C module, read the identity EEPROM
//! 6. Replace the default password, program Ethernet, write identity files
//! 7. Unmount /proc, /sys and /dev, switch root, exec init
//! ```
//!
//! Steps 4 and 5 degrade gracefully. Step 6 is skipped without a valid
//! EEPROM record. Everything else is fatal.

use anyhow::{Context, Result};
use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::thread;

use log::{error, info};

use crate::cmdline::BootParams;
use crate::config::{BootConfig, BUS_MODULE, CLOCK_MODULES, ROOT_SETTLE_DELAY};
use crate::eeprom::{self, EepromRecord};
use crate::ethernet;
use crate::identity;
use crate::kmod::{Modprobe, ModuleLoader};
use crate::mount::{self, MountRequest, RobustMount, SystemMount};
use crate::rtc;
use crate::update::{self, PasswordHasher, UnixCrypt};

/// Kernel filesystems of the initramfs, in mount order: (source, target, type).
const PSEUDO_FILESYSTEMS: [(&str, &str, &str); 3] = [
    ("proc", "/proc", "proc"),
    ("sysfs", "/sys", "sysfs"),
    ("devtmpfs", "/dev", "devtmpfs"),
];

/// Run `step` with the EEPROM record, or log why it is skipped.
fn with_record<T>(
    record: Option<&EepromRecord>,
    what: &str,
    step: impl FnOnce(&EepromRecord) -> Result<T>,
) -> Result<Option<T>> {
    match record {
        Some(record) => step(record).map(Some),
        None => {
            error!("required EEPROM data not available, skipping {}", what);
            Ok(None)
        }
    }
}

/// Apply the EEPROM identity to the staged root and the hardware.
pub fn provision(
    config: &BootConfig,
    record: Option<&EepromRecord>,
    hasher: &dyn PasswordHasher,
) -> Result<()> {
    with_record(record, "password replacement", |record| {
        update::replace_password(config, record, hasher)
    })?;

    with_record(record, "Ethernet configuration", |record| {
        ethernet::provision(config, record)
    })?;

    if let Some(updated) = with_record(record, "identity file update", |record| {
        identity::write_identity_files(config, record)
    })? {
        info!("{} identity file(s) updated", updated);
    }

    Ok(())
}

/// Load modules and set the system clock. A clock failure is only logged.
fn sync_clock(config: &BootConfig, modprobe: &dyn ModuleLoader) -> Result<()> {
    for module in CLOCK_MODULES {
        modprobe.load(module)?;
    }

    if let Err(e) = rtc::sync_system_clock(&config.rtc_path) {
        error!("{:#}", e);
    }

    Ok(())
}

/// Replace this process with `init`. Only returns on failure.
fn exec_init(init: &str, staging: &Path) -> Result<Infallible> {
    info!("executing {} in {}", init, staging.display());

    let err = Command::new(init).exec();
    Err(err).with_context(|| format!("could not execute {} in {}", init, staging.display()))
}

/// Boot the board. Returns only on error.
pub fn run(config: &BootConfig) -> Result<Infallible> {
    let [proc_fs, sys_fs, dev_fs] = PSEUDO_FILESYSTEMS;

    mount::mount_pseudo(proc_fs.0, Path::new(proc_fs.1), proc_fs.2)?;
    let params = BootParams::read(&config.cmdline_path)?;

    for (source, target, fstype) in [sys_fs, dev_fs] {
        mount::mount_pseudo(source, Path::new(target), fstype)?;
    }

    // Lets the SD card show up before the first attempt
    thread::sleep(ROOT_SETTLE_DELAY);

    let root = MountRequest {
        source: &params.root,
        target: &config.staging_dir,
        fstype: &params.rootfstype,
        flags: libc::MS_NOATIME,
    };
    RobustMount::default().mount(&root, SystemMount::new)?;

    mount::mount_pseudo("devtmpfs", &config.staging_dev_dir(), "devtmpfs")?;

    let modprobe = Modprobe::for_running_kernel(&config.modules_dir, &config.sys_module_dir)?;
    sync_clock(config, &modprobe)?;

    modprobe.load(BUS_MODULE)?;
    let record = eeprom::read_eeprom(config);

    provision(config, record.as_ref(), &UnixCrypt)?;

    for (_, target, _) in PSEUDO_FILESYSTEMS {
        mount::unmount_pseudo(Path::new(target))?;
    }

    mount::switch_root(&config.staging_dir)?;

    exec_init(&params.init, &config.staging_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Owner;
    use crate::eeprom::ProductionDate;
    use std::cell::RefCell;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use tempfile::{tempdir, TempDir};

    struct NeverHash;

    impl PasswordHasher for NeverHash {
        fn hash(&self, _password: &str, _salt: &str) -> Result<String> {
            anyhow::bail!("hasher must not be used")
        }
    }

    #[derive(Default)]
    struct RecordingLoader {
        loaded: RefCell<Vec<String>>,
    }

    impl ModuleLoader for RecordingLoader {
        fn load(&self, name: &str) -> Result<()> {
            self.loaded.borrow_mut().push(name.to_string());
            Ok(())
        }
    }

    fn record() -> EepromRecord {
        EepromRecord {
            version: 1,
            production_date: ProductionDate(0x2020_0827),
            uid: b"Xy9Za".to_vec(),
            hostname: b"tng-base-Xy9Za".to_vec(),
            encrypted_password: b"$6$devSALT$devicedigest".to_vec(),
            ethernet_config: [0; 256],
        }
    }

    fn staged_root() -> Result<(TempDir, BootConfig)> {
        let dir = tempdir()?;
        let etc = dir.path().join("etc");
        fs::create_dir(&etc)?;
        fs::write(etc.join("shadow"), "root:*:18500::::::\ntng:*:18500::::::\n")?;

        let metadata = fs::metadata(dir.path())?;
        let config = BootConfig {
            staging_dir: dir.path().to_path_buf(),
            shadow_path: etc.join("shadow"),
            identity_dir: etc,
            ethernet_device: dir.path().join("ethernet"),
            rtc_path: dir.path().join("rtc0"),
            identity_owner: Owner {
                uid: metadata.uid(),
                gid: metadata.gid(),
            },
            ..BootConfig::default()
        };
        Ok((dir, config))
    }

    #[test]
    fn test_without_record_everything_is_skipped() -> Result<()> {
        let (_dir, config) = staged_root()?;

        provision(&config, None, &NeverHash)?;

        assert!(!config.identity_dir.join(identity::UID_FILE).exists());
        assert!(!config.shadow_backup_path().exists());
        Ok(())
    }

    #[test]
    fn test_ethernet_failure_stops_provisioning() -> Result<()> {
        let (_dir, config) = staged_root()?;

        // No net/ directory under the Ethernet device
        let err = provision(&config, Some(&record()), &NeverHash).unwrap_err();
        assert!(format!("{:#}", err).contains("net/"));

        // Identity files come after Ethernet and were never written
        assert!(!config.identity_dir.join(identity::UID_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_clock_failure_is_not_fatal() -> Result<()> {
        let (_dir, config) = staged_root()?;
        let loader = RecordingLoader::default();

        sync_clock(&config, &loader)?;
        assert_eq!(loader.loaded.borrow().as_slice(), CLOCK_MODULES);
        Ok(())
    }

    #[test]
    fn test_exec_failure_is_an_error() {
        let err = exec_init("/nonexistent/sbin/init", Path::new("/mnt")).unwrap_err();
        assert!(err.to_string().contains("could not execute /nonexistent/sbin/init"));
    }
}
