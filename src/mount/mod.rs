//! Filesystem mounting for early boot.
//!
//! - [`RobustMount`] mounts the root device, retrying while the device node has
//!   not shown up yet. Any other error is returned at once.
//! - [`SystemMount`] is the [`MountEngine`] used on the board. It snapshots the
//!   block devices when constructed, so a fresh engine is built per attempt.
//! - [`mount_fs`], [`unmount`] and [`switch_root`] are thin wrappers over the
//!   syscalls for the pseudo filesystems and the final root switch.

mod source;

pub use source::{BlockDevices, Partition, SourceSpec};

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::thread;
use std::time::Duration;

use log::{error, info};
use thiserror::Error;

use crate::logger::plural;

/// Mount flags as passed to mount(2).
pub type MountFlags = libc::c_ulong;

/// One mount operation.
#[derive(Debug, Clone, Copy)]
pub struct MountRequest<'a> {
    pub source: &'a str,
    pub target: &'a Path,
    pub fstype: &'a str,
    pub flags: MountFlags,
}

/// Why a single mount attempt failed.
#[derive(Debug, Error)]
pub enum MountError {
    /// The backing device does not exist (yet)
    #[error("device is missing")]
    NoSource,
    /// Anything else; never retried
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Performs exactly one mount attempt.
pub trait MountEngine {
    fn mount(&mut self, request: &MountRequest<'_>) -> Result<(), MountError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

/// Mount with unbounded retries for the "device not present" case only.
#[derive(Debug, Clone, Copy)]
pub struct RobustMount {
    backoff: Duration,
}

impl Default for RobustMount {
    fn default() -> Self {
        Self::new(crate::config::MOUNT_RETRY_BACKOFF)
    }
}

impl RobustMount {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Mount `request`, building a new engine with `new_engine` for every attempt.
    ///
    /// Returns the number of retries it took.
    pub fn mount<E, F>(&self, request: &MountRequest<'_>, mut new_engine: F) -> Result<usize>
    where
        E: MountEngine,
        F: FnMut() -> Result<E>,
    {
        info!(
            "mounting {} ({}) at {}",
            request.source,
            request.fstype,
            request.target.display()
        );

        let mut retries = 0;

        loop {
            let mut engine = new_engine().context("could not create mount context")?;

            match engine.mount(request) {
                Ok(()) => break,
                Err(MountError::NoSource) => {
                    error!(
                        "could not mount {} ({}) at {}, device is missing, trying again in {} msec",
                        request.source,
                        request.fstype,
                        request.target.display(),
                        self.backoff.as_millis()
                    );

                    drop(engine);
                    thread::sleep(self.backoff);
                    retries += 1;
                }
                Err(MountError::Io(e)) => {
                    return Err(e).with_context(|| {
                        format!(
                            "could not mount {} ({}) at {}",
                            request.source,
                            request.fstype,
                            request.target.display()
                        )
                    });
                }
            }
        }

        if retries > 0 {
            info!(
                "successfully mounted {} ({}) at {} after {} {}",
                request.source,
                request.fstype,
                request.target.display(),
                retries,
                plural(retries, "retry", "retries")
            );
        }

        Ok(retries)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Board mount engine
// ─────────────────────────────────────────────────────────────────────────────

/// Mount engine backed by mount(2) and a snapshot of `/sys/class/block`.
pub struct SystemMount {
    devices: BlockDevices,
}

impl SystemMount {
    /// Snapshot the block devices currently known to the kernel.
    pub fn new() -> Result<Self> {
        Self::with_roots(Path::new("/sys/class/block"), Path::new("/dev"))
    }

    pub fn with_roots(sys_block: &Path, dev_dir: &Path) -> Result<Self> {
        let devices = BlockDevices::scan(sys_block, dev_dir)
            .with_context(|| format!("could not scan {}", sys_block.display()))?;
        Ok(Self { devices })
    }

    /// Resolve a mount source to a device node, if it exists right now.
    pub fn resolve(&self, source: &str) -> Option<PathBuf> {
        self.devices.resolve(source)
    }
}

impl MountEngine for SystemMount {
    fn mount(&mut self, request: &MountRequest<'_>) -> Result<(), MountError> {
        let device = self.resolve(request.source).ok_or(MountError::NoSource)?;
        let device = device.to_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "device path is not UTF-8")
        })?;

        mount_fs(device, request.target, request.fstype, request.flags)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Syscall wrappers
// ─────────────────────────────────────────────────────────────────────────────

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn c_path(path: &Path) -> io::Result<CString> {
    c_string(path.as_os_str().as_bytes())
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// mount(2) without filesystem-specific data.
pub fn mount_fs(source: &str, target: &Path, fstype: &str, flags: MountFlags) -> io::Result<()> {
    let source = c_string(source.as_bytes())?;
    let target = c_path(target)?;
    let fstype = c_string(fstype.as_bytes())?;

    // SAFETY: all pointers are valid NUL-terminated strings for the call's duration.
    check(unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            flags,
            ptr::null(),
        )
    })
}

/// umount(2).
pub fn unmount(target: &Path) -> io::Result<()> {
    let target = c_path(target)?;

    // SAFETY: target is a valid NUL-terminated string.
    check(unsafe { libc::umount(target.as_ptr()) })
}

/// Mount a pseudo filesystem, logging first.
pub fn mount_pseudo(source: &str, target: &Path, fstype: &str) -> Result<()> {
    info!("mounting {} at {}", source, target.display());

    mount_fs(source, target, fstype, 0)
        .with_context(|| format!("could not mount {} at {}", source, target.display()))
}

/// Unmount a pseudo filesystem, logging first.
pub fn unmount_pseudo(target: &Path) -> Result<()> {
    info!("unmounting {}", target.display());

    unmount(target).with_context(|| format!("could not unmount {}", target.display()))
}

/// Promote `staging` to `/` for this process.
///
/// Same sequence as busybox switch_root, minus deleting the old rootfs
/// contents: chdir into the new root, move-mount it onto `/`, chroot, chdir `/`.
pub fn switch_root(staging: &Path) -> Result<()> {
    info!("switching root-mount to {}", staging.display());

    std::env::set_current_dir(staging).with_context(|| {
        format!("could not change current directory to {}", staging.display())
    })?;

    // Unlink ourselves to free some memory
    let _ = fs::remove_file("/init");

    let dot = c_string(b".")?;
    let slash = c_string(b"/")?;

    // SAFETY: valid NUL-terminated strings; fstype and data may be NULL for MS_MOVE.
    check(unsafe {
        libc::mount(
            dot.as_ptr(),
            slash.as_ptr(),
            ptr::null(),
            libc::MS_MOVE,
            ptr::null(),
        )
    })
    .context("could not move root-mount")?;

    std::os::unix::fs::chroot(".")
        .with_context(|| format!("could not chroot into {}", staging.display()))?;

    std::env::set_current_dir("/").context("could not change current directory to /")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Engine that reports a missing device until `absent` attempts have passed.
    struct ScriptedEngine {
        attempts: Rc<Cell<usize>>,
        absent: usize,
        other_error: bool,
    }

    impl MountEngine for ScriptedEngine {
        fn mount(&mut self, _request: &MountRequest<'_>) -> Result<(), MountError> {
            let attempt = self.attempts.get();
            self.attempts.set(attempt + 1);

            if self.other_error {
                return Err(MountError::Io(io::Error::from_raw_os_error(libc::EINVAL)));
            }
            if attempt < self.absent {
                return Err(MountError::NoSource);
            }
            Ok(())
        }
    }

    fn request() -> MountRequest<'static> {
        MountRequest {
            source: "/dev/mmcblk0p2",
            target: Path::new("/mnt"),
            fstype: "ext4",
            flags: libc::MS_NOATIME,
        }
    }

    #[test]
    fn test_mount_first_try() {
        let attempts = Rc::new(Cell::new(0));
        let retries = RobustMount::new(Duration::ZERO)
            .mount(&request(), || {
                Ok(ScriptedEngine {
                    attempts: attempts.clone(),
                    absent: 0,
                    other_error: false,
                })
            })
            .unwrap();

        assert_eq!(retries, 0);
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_retries_while_device_absent() {
        let attempts = Rc::new(Cell::new(0));
        let engines_built = Rc::new(Cell::new(0));

        let retries = RobustMount::new(Duration::ZERO)
            .mount(&request(), || {
                engines_built.set(engines_built.get() + 1);
                Ok(ScriptedEngine {
                    attempts: attempts.clone(),
                    absent: 4,
                    other_error: false,
                })
            })
            .unwrap();

        assert_eq!(retries, 4);
        assert_eq!(attempts.get(), 5);
        // A new engine for every attempt
        assert_eq!(engines_built.get(), 5);
    }

    #[test]
    fn test_other_error_is_not_retried() {
        let attempts = Rc::new(Cell::new(0));
        let result = RobustMount::new(Duration::ZERO).mount(&request(), || {
            Ok(ScriptedEngine {
                attempts: attempts.clone(),
                absent: 0,
                other_error: true,
            })
        });

        let err = result.unwrap_err();
        assert_eq!(attempts.get(), 1);
        assert!(format!("{:#}", err).contains("could not mount /dev/mmcblk0p2 (ext4) at /mnt"));
    }

    #[test]
    fn test_engine_creation_failure_is_fatal() {
        let result = RobustMount::new(Duration::ZERO)
            .mount(&request(), || -> Result<ScriptedEngine> { anyhow::bail!("no memory") });
        assert!(result.is_err());
    }

    #[test]
    fn test_system_mount_missing_device_is_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine =
            SystemMount::with_roots(&dir.path().join("sys"), &dir.path().join("dev")).unwrap();

        let missing = dir.path().join("dev/mmcblk0p2");
        let missing = missing.to_str().unwrap();
        let result = engine.mount(&MountRequest {
            source: missing,
            ..request()
        });

        assert!(matches!(result, Err(MountError::NoSource)));
    }

    #[test]
    fn test_c_string_rejects_interior_nul() {
        assert!(c_string(b"/dev/\0sda").is_err());
    }
}
