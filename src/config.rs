//! TNG Base board configuration.
//!
//! Every well-known path and tunable the init program touches lives here.
//! [`BootConfig::default`] describes the production Raspberry Pi CM board;
//! tests construct their own with paths inside a temporary directory.
//!
//! # Example
//!
//! ```rust
//! use tng_init::config::BootConfig;
//!
//! let config = BootConfig::default();
//! assert_eq!(config.staging_dir.to_str(), Some("/mnt"));
//! assert_eq!(config.eeprom_address, 0x50);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Account whose locked default password gets replaced.
pub const ACCOUNT_NAME: &str = "tng";

/// Password every image ships with before provisioning.
pub const DEFAULT_PASSWORD: &str = "default-tng-password";

/// Defaults applied when the kernel command line omits a key.
pub const DEFAULT_ROOT: &str = "/dev/mmcblk0p2";
pub const DEFAULT_ROOTFSTYPE: &str = "ext4";
pub const DEFAULT_INIT: &str = "/sbin/init";

/// Shadow databases larger than this are rejected.
pub const SHADOW_MAX_LENGTH: u64 = 512 * 1024;

/// Longest encrypted-password field accepted from the shadow database.
pub const SHADOW_ENCRYPTED_MAX_LENGTH: usize = 512;

/// Delay before the first root mount attempt, lets the SD card show up.
pub const ROOT_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Backoff between root mount attempts while the device is missing.
pub const MOUNT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Delay between writing the Ethernet config and reading it back.
pub const ETHERNET_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Kernel modules needed before the RTC can be read.
pub const CLOCK_MODULES: &[&str] = &["i2c_bcm2835", "rtc_pcf8523"];

/// Kernel module exposing the I2C bus as a character device.
pub const BUS_MODULE: &str = "i2c_dev";

/// Owner applied to files the init program creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub const ROOT: Owner = Owner { uid: 0, gid: 0 };
}

/// Paths and hardware coordinates for one boot.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Where the root filesystem is staged before the root switch
    pub staging_dir: PathBuf,
    /// Kernel command line
    pub cmdline_path: PathBuf,
    /// Kernel log device
    pub kmsg_path: PathBuf,
    /// Software reboot request interface
    pub sysrq_path: PathBuf,
    /// I2C bus the identity EEPROM sits on
    pub eeprom_bus: PathBuf,
    /// 7-bit slave address of the identity EEPROM
    pub eeprom_address: u16,
    /// Hardware clock device
    pub rtc_path: PathBuf,
    /// Kernel module tree, one subdirectory per release
    pub modules_dir: PathBuf,
    /// Loaded module registry
    pub sys_module_dir: PathBuf,
    /// Shadow password database on the staged root
    pub shadow_path: PathBuf,
    /// Platform device of the on-board USB Ethernet controller
    pub ethernet_device: PathBuf,
    /// Directory holding the `tng-base-*` identity files
    pub identity_dir: PathBuf,
    /// Owner for the identity files
    pub identity_owner: Owner,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/mnt"),
            cmdline_path: PathBuf::from("/proc/cmdline"),
            kmsg_path: PathBuf::from("/dev/kmsg"),
            sysrq_path: PathBuf::from("/proc/sysrq-trigger"),
            eeprom_bus: PathBuf::from("/dev/i2c-1"),
            eeprom_address: 0x50,
            rtc_path: PathBuf::from("/dev/rtc0"),
            modules_dir: PathBuf::from("/mnt/lib/modules"),
            sys_module_dir: PathBuf::from("/sys/module"),
            shadow_path: PathBuf::from("/mnt/etc/shadow"),
            ethernet_device: PathBuf::from(
                "/sys/devices/platform/soc/3f980000.usb/usb1/1-1/1-1.7/1-1.7:1.0/",
            ),
            identity_dir: PathBuf::from("/mnt/etc"),
            identity_owner: Owner::ROOT,
        }
    }
}

impl BootConfig {
    /// Backup copy of the unmodified shadow database (`shadow-`).
    pub fn shadow_backup_path(&self) -> PathBuf {
        suffixed(&self.shadow_path, "-")
    }

    /// Staging file for the rewritten shadow database (`shadow+`).
    pub fn shadow_tmp_path(&self) -> PathBuf {
        suffixed(&self.shadow_path, "+")
    }

    /// Device node filesystem inside the staged root.
    pub fn staging_dev_dir(&self) -> PathBuf {
        self.staging_dir.join("dev")
    }
}

/// Append `suffix` to the final component of `path` (`/etc/shadow` -> `/etc/shadow-`).
pub fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
