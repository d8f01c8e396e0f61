//! Terminal failure handling.
//!
//! [`fatal`] is the only way the init program ends abnormally. It logs the
//! reason, makes sure `/proc` is usable, gives an observer 60 seconds to read
//! the console and then asks the kernel for an immediate reboot through
//! `/proc/sysrq-trigger`. If even that fails it parks forever: exiting PID 1
//! would panic the kernel with a far less useful message.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::config::BootConfig;
use crate::logger::PANIC_TARGET;
use crate::mount;

/// Control sequence for an immediate reboot.
const SYSRQ_REBOOT: &[u8] = b"b\n";

/// Reboot countdown: (seconds left when announced, seconds to sleep after).
///
/// Coarse steps first, then one announcement per second for the last five.
pub fn countdown() -> Vec<(u64, u64)> {
    let mut steps = vec![(60, 50), (10, 5)];
    steps.extend((1..=5).rev().map(|left| (left, 1)));
    steps
}

/// Abort the boot. Never returns.
pub fn fatal(err: anyhow::Error) -> ! {
    error!(target: PANIC_TARGET, "{:#}", err);

    ensure_proc();

    for (left, sleep) in countdown() {
        info!("triggering reboot in {} sec", left);
        thread::sleep(Duration::from_secs(sleep));
    }

    match request_reboot(&BootConfig::default().sysrq_path) {
        Ok(()) => info!("reboot triggered"),
        Err(e) => error!("could not write reboot request to /proc/sysrq-trigger: {}", e),
    }

    loop {
        thread::sleep(Duration::from_secs(1000));
    }
}

/// Create and mount `/proc`, tolerating both already being done.
fn ensure_proc() {
    let proc_dir = Path::new("/proc");

    if let Err(e) = fs::create_dir(proc_dir) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            error!("could not create /proc: {}", e);
        }
    }

    if let Err(e) = mount::mount_fs("proc", proc_dir, "proc", 0) {
        if e.raw_os_error() != Some(libc::EBUSY) {
            error!("could not mount proc at /proc: {}", e);
        }
    }
}

/// Write the reboot request to a sysrq trigger file.
pub fn request_reboot(sysrq_path: &Path) -> io::Result<()> {
    let mut trigger = OpenOptions::new().write(true).open(sysrq_path)?;
    trigger.write_all(SYSRQ_REBOOT)?;
    trigger.flush()
}
