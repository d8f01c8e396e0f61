//! Kernel command line parsing.
//!
//! Only three keys matter to the init program: `root=`, `rootfstype=` and
//! `init=`. Everything else on the line is ignored. A key given more than
//! once keeps its last value.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::{DEFAULT_INIT, DEFAULT_ROOT, DEFAULT_ROOTFSTYPE};

/// The kernel reads at most this much of the command line.
const CMDLINE_MAX_LENGTH: usize = 2047;

/// Boot parameters with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootParams {
    /// Root device (path or `PARTUUID=`-style tag)
    pub root: String,
    /// Root filesystem type
    pub rootfstype: String,
    /// Program to execute after the root switch
    pub init: String,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            rootfstype: DEFAULT_ROOTFSTYPE.to_string(),
            init: DEFAULT_INIT.to_string(),
        }
    }
}

impl BootParams {
    /// Parse a command line, filling in defaults for missing keys.
    pub fn parse(cmdline: &str) -> Self {
        let mut root = None;
        let mut rootfstype = None;
        let mut init = None;

        for option in cmdline.split(['\r', '\n', '\t', ' ']).filter(|s| !s.is_empty()) {
            if let Some(value) = option.strip_prefix("root=") {
                root = Some(value);
            } else if let Some(value) = option.strip_prefix("rootfstype=") {
                rootfstype = Some(value);
            } else if let Some(value) = option.strip_prefix("init=") {
                init = Some(value);
            }
        }

        let defaults = Self::default();

        Self {
            root: root.map(str::to_string).unwrap_or(defaults.root),
            rootfstype: rootfstype.map(str::to_string).unwrap_or(defaults.rootfstype),
            init: init.map(str::to_string).unwrap_or(defaults.init),
        }
    }

    /// Read and parse the command line from `path` (normally `/proc/cmdline`).
    pub fn read(path: &Path) -> Result<Self> {
        log::info!("reading {}", path.display());

        let bytes = fs::read(path)
            .with_context(|| format!("could not read from {}", path.display()))?;
        let bytes = &bytes[..bytes.len().min(CMDLINE_MAX_LENGTH)];

        Ok(Self::parse(&String::from_utf8_lossy(bytes)))
    }
}
