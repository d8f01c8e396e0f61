//! Log backend for the initramfs.
//!
//! Every line goes out as `initramfs: <message>`, with `error: ` inserted for
//! error records and `panic: ` for the failure handler's announcement. Lines
//! are written to `/dev/kmsg` when it can be opened, otherwise to stdout.
//! There is no configuration: the kernel log is simply preferred.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Target used by [`crate::failure`] for its final announcement.
pub const PANIC_TARGET: &str = "panic";

const PREFIX: &str = "initramfs: ";

struct InitramfsLogger {
    kmsg: Mutex<Option<File>>,
}

impl Log for InitramfsLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format_line(record.level(), record.target(), record.args());
        let mut kmsg = match self.kmsg.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // kmsg takes one record per write(2)
        let written = match kmsg.as_mut() {
            Some(file) => file.write_all(line.as_bytes()).is_ok(),
            None => false,
        };

        if !written {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(line.as_bytes());
            let _ = stdout.flush();
        }
    }

    fn flush(&self) {}
}

static LOGGER: InitramfsLogger = InitramfsLogger {
    kmsg: Mutex::new(None),
};

/// Install the logger, sending lines to `kmsg_path` if it can be opened.
///
/// Calling this twice only swaps the sink.
pub fn init(kmsg_path: &Path) {
    let kmsg = OpenOptions::new().write(true).open(kmsg_path).ok();

    match LOGGER.kmsg.lock() {
        Ok(mut guard) => *guard = kmsg,
        Err(poisoned) => *poisoned.into_inner() = kmsg,
    }

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Render one log line, newline included.
pub fn format_line(level: Level, target: &str, args: &fmt::Arguments<'_>) -> String {
    let kind = if target == PANIC_TARGET {
        "panic: "
    } else if level == Level::Error {
        "error: "
    } else {
        ""
    };

    format!("{PREFIX}{kind}{args}\n")
}

/// Singular/plural helper for counts in log messages.
pub fn plural(count: usize, one: &'static str, many: &'static str) -> &'static str {
    if count == 1 {
        one
    } else {
        many
    }
}
