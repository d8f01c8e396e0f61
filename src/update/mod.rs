//! Crash-safe file updates.
//!
//! Files are replaced only when their content, owner or mode differ from
//! what is wanted. The new content goes to a sibling staging file which is
//! synced and then renamed over the target, so the target path only ever
//! shows the old or the new content.

pub mod shadow;

pub use shadow::{replace_password, PasswordHasher, ShadowOutcome, UnixCrypt};

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{fchown, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use log::{error, info};

use crate::config::{suffixed, Owner};

/// Mode of every generated file.
pub const FILE_MODE: u32 = 0o444;

/// What [`update_file`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Unchanged,
}

/// Does `path` already hold exactly `content`, with the wanted owner and mode?
fn is_current<R>(path: &Path, content: &[u8], owner: Owner, read: R) -> Result<bool>
where
    R: FnOnce(&Path) -> io::Result<Vec<u8>>,
{
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return Ok(false),
    };

    if !metadata.file_type().is_file()
        || metadata.mode() & 0o7777 != FILE_MODE
        || metadata.uid() != owner.uid
        || metadata.gid() != owner.gid
        || metadata.len() != content.len() as u64
    {
        return Ok(false);
    }

    let existing = read(path).with_context(|| format!("could not read {}", path.display()))?;

    Ok(existing == content)
}

/// Write `content` to `tmp` with owner and mode applied, synced to disk.
pub(crate) fn write_synced(tmp: &Path, content: &[u8], owner: Owner, mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(tmp)
        .with_context(|| format!("could not open {} for writing", tmp.display()))?;

    fchown(&file, Some(owner.uid), Some(owner.gid))
        .with_context(|| format!("could not change owner of {}", tmp.display()))?;

    // The creation mode is filtered by the umask
    file.set_permissions(fs::Permissions::from_mode(mode))
        .with_context(|| format!("could not change mode of {}", tmp.display()))?;

    file.write_all(content)
        .with_context(|| format!("could not write {}", tmp.display()))?;

    file.sync_all()
        .with_context(|| format!("could not sync {}", tmp.display()))?;

    Ok(())
}

/// Replace `path` with `content` unless it is already current.
///
/// A failed comparison read is logged and treated as stale. Every failure
/// after that is returned.
pub fn update_file(path: &Path, content: &[u8], owner: Owner) -> Result<UpdateOutcome> {
    update_file_with(path, content, owner, |path: &Path| fs::read(path))
}

fn update_file_with<R>(
    path: &Path,
    content: &[u8],
    owner: Owner,
    read: R,
) -> Result<UpdateOutcome>
where
    R: FnOnce(&Path) -> io::Result<Vec<u8>>,
{
    match is_current(path, content, owner, read) {
        Ok(true) => {
            info!("{} is already up-to-date, skipping update", path.display());
            return Ok(UpdateOutcome::Unchanged);
        }
        Ok(false) => {}
        Err(e) => error!("{:#}", e),
    }

    info!("updating {}", path.display());

    let tmp = suffixed(path, ".tmp");
    write_synced(&tmp, content, owner, FILE_MODE)?;

    fs::rename(&tmp, path)
        .with_context(|| format!("could not rename {} to {}", tmp.display(), path.display()))?;

    Ok(UpdateOutcome::Updated)
}
