//! TNG Base initramfs init.
//!
//! The first user-space program on a TNG Base board. It stages the root
//! filesystem, applies the per-device identity stored in the board's EEPROM
//! and hands over to the real init.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`boot`] | The boot sequence |
//! | [`mount`] | Root mount with retry, pseudo filesystems, root switch |
//! | [`eeprom`] | Identity EEPROM format, bus access, validation |
//! | [`update`] | Crash-safe file replacement, shadow password swap |
//! | [`ethernet`] | Ethernet controller programming |
//! | [`identity`] | `tng-base-*` files |
//! | [`kmod`] | Kernel module loading |
//! | [`rtc`] | System clock from the RTC |
//! | [`failure`] | Log, wait, reboot |

pub mod boot;
pub mod cmdline;
pub mod config;
pub mod eeprom;
pub mod ethernet;
pub mod failure;
pub mod identity;
pub mod kmod;
pub mod logger;
pub mod mount;
pub mod rtc;
pub mod update;

pub use boot::run;
pub use config::BootConfig;
pub use eeprom::{EepromError, EepromRecord};
