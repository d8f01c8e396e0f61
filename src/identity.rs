//! The `tng-base-*` identity files.
//!
//! Three single-value files on the staged root expose the EEPROM identity to
//! the rest of the system:
//!
//! | File | Content |
//! |------|---------|
//! | `tng-base-production-date` | `YYYY-MM-DD` |
//! | `tng-base-uid` | unique id |
//! | `tng-base-hostname` | hostname |

use anyhow::Result;

use log::info;

use crate::config::BootConfig;
use crate::eeprom::EepromRecord;
use crate::update::{update_file, UpdateOutcome};

pub const PRODUCTION_DATE_FILE: &str = "tng-base-production-date";
pub const UID_FILE: &str = "tng-base-uid";
pub const HOSTNAME_FILE: &str = "tng-base-hostname";

fn line(value: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(value.len() + 1);
    content.extend_from_slice(value);
    content.push(b'\n');
    content
}

/// File name and content for each identity file.
pub fn render(record: &EepromRecord) -> Vec<(&'static str, Vec<u8>)> {
    vec![
        (PRODUCTION_DATE_FILE, line(record.production_date.to_string().as_bytes())),
        (UID_FILE, line(&record.uid)),
        (HOSTNAME_FILE, line(&record.hostname)),
    ]
}

/// Bring the identity files in line with `record`. Returns how many changed.
pub fn write_identity_files(config: &BootConfig, record: &EepromRecord) -> Result<usize> {
    info!("updating {}/tng-base-* files", config.identity_dir.display());

    let mut updated = 0;
    for (name, content) in render(record) {
        let path = config.identity_dir.join(name);
        if update_file(&path, &content, config.identity_owner)? == UpdateOutcome::Updated {
            updated += 1;
        }
    }

    Ok(updated)
}
