//! Replacing the default password in the shadow database.
//!
//! Images ship with the `tng` account locked (`!` prefix) on a well-known
//! default password. On first boot that hash is swapped for the device
//! specific one from the EEPROM. Anything else about the entry means someone
//! already took care of the account, and it is left alone.
//!
//! The replacement keeps an untouched copy at `shadow-` and stages the new
//! database at `shadow+` before renaming it into place.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::ops::Range;
use std::os::unix::fs::MetadataExt;

use log::{error, info};

use super::write_synced;
use crate::config::{
    BootConfig, Owner, ACCOUNT_NAME, DEFAULT_PASSWORD, SHADOW_ENCRYPTED_MAX_LENGTH,
    SHADOW_MAX_LENGTH,
};
use crate::eeprom::EepromRecord;

/// crypt(3)-style password hashing.
pub trait PasswordHasher {
    /// Hash `password` under `salt`, returning the full encrypted string.
    fn hash(&self, password: &str, salt: &str) -> Result<String>;
}

/// The system's crypt(3) algorithms (DES, MD5, SHA-256, SHA-512, bcrypt).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixCrypt;

impl PasswordHasher for UnixCrypt {
    fn hash(&self, password: &str, salt: &str) -> Result<String> {
        pwhash::unix::crypt(password, salt)
            .map_err(|e| anyhow!("could not encrypt default password: {}", e))
    }
}

/// What [`replace_password`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOutcome {
    /// Default hash replaced by the device specific one
    Replaced,
    /// No entry for the account
    AccountMissing,
    /// Password field starts with `*`
    NoPassword,
    /// Password field is not locked with `!`
    NotLocked,
    /// Locked, but not on the default password
    NotDefault,
}

/// Where the account's entry sits in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Missing,
    /// Byte range of the encrypted-password field, `!` included
    Found(Range<usize>),
}

fn malformed() -> anyhow::Error {
    anyhow!("encrypted section for account {} is malformed", ACCOUNT_NAME)
}

/// Find the encrypted-password field of `account`.
fn locate(buffer: &[u8], account: &str) -> Result<Entry> {
    let mut needle = Vec::with_capacity(account.len() + 2);
    needle.push(b'\n');
    needle.extend_from_slice(account.as_bytes());
    needle.push(b':');

    let entry_begin = if buffer.starts_with(&needle[1..]) {
        0
    } else {
        match buffer.windows(needle.len()).position(|w| w == needle.as_slice()) {
            Some(position) => position + 1,
            None => return Ok(Entry::Missing),
        }
    };

    let line_end = buffer[entry_begin..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(buffer.len(), |p| entry_begin + p);
    let line = &buffer[entry_begin..line_end];

    // The account name carries no colon, so the first one ends it
    let name_end = line.iter().position(|&b| b == b':').ok_or_else(malformed)?;
    let field_begin = entry_begin + name_end + 1;

    // A field that is not locked is not examined further
    if !matches!(buffer.get(field_begin), Some(b'!')) {
        return Ok(Entry::Found(field_begin..field_begin));
    }

    let field_end = buffer[field_begin..line_end]
        .iter()
        .position(|&b| b == b':')
        .map(|p| field_begin + p)
        .ok_or_else(malformed)?;

    Ok(Entry::Found(field_begin..field_end))
}

/// Salt and algorithm prefix of an encrypted password.
///
/// Traditional DES hashes use the first two characters. Modular hashes
/// (`$id$salt$digest`) use everything before the last `$`.
pub fn salt_of(encrypted: &str) -> Result<&str> {
    if encrypted.len() < 2 {
        return Err(malformed());
    }

    if !encrypted.starts_with('$') {
        return encrypted.get(..2).ok_or_else(malformed);
    }

    match encrypted.rfind('$') {
        Some(end) => Ok(&encrypted[..end]),
        None => Err(malformed()),
    }
}

/// Swap the default password of the `tng` account for the one from `record`.
pub fn replace_password(
    config: &BootConfig,
    record: &EepromRecord,
    hasher: &dyn PasswordHasher,
) -> Result<ShadowOutcome> {
    let path = &config.shadow_path;

    info!("reading {}", path.display());

    let metadata = fs::metadata(path)
        .with_context(|| format!("could not get status of {}", path.display()))?;
    if metadata.len() > SHADOW_MAX_LENGTH {
        bail!("{} is too big", path.display());
    }

    let buffer = fs::read(path).with_context(|| format!("could not read from {}", path.display()))?;
    if buffer.len() as u64 != metadata.len() {
        bail!("short read from {}", path.display());
    }

    let field = match locate(&buffer, ACCOUNT_NAME)? {
        Entry::Missing => {
            info!("account {} is not present, skipping password replacement", ACCOUNT_NAME);
            return Ok(ShadowOutcome::AccountMissing);
        }
        Entry::Found(field) => field,
    };

    match buffer.get(field.start) {
        Some(b'*') => {
            info!("account {} has no password set, skipping password replacement", ACCOUNT_NAME);
            return Ok(ShadowOutcome::NoPassword);
        }
        Some(b'!') => {}
        _ => {
            info!("account {} is not locked, skipping password replacement", ACCOUNT_NAME);
            return Ok(ShadowOutcome::NotLocked);
        }
    }

    // Skip the exclamation mark
    let encrypted = &buffer[field.start + 1..field.end];
    if encrypted.len() > SHADOW_ENCRYPTED_MAX_LENGTH {
        bail!("encrypted section for account {} is too big", ACCOUNT_NAME);
    }

    if encrypted.len() < 2 {
        return Err(malformed());
    }

    // A hash that cannot be reproduced is not the default one
    let is_default = std::str::from_utf8(encrypted)
        .map_err(|_| anyhow!("encrypted section for account {} is not valid UTF-8", ACCOUNT_NAME))
        .and_then(|encrypted| {
            let salt = salt_of(encrypted)?;
            Ok(hasher.hash(DEFAULT_PASSWORD, salt)? == encrypted)
        })
        .unwrap_or_else(|e| {
            error!("{:#}", e);
            false
        });

    if !is_default {
        info!(
            "account {} does not have the default password set, skipping password replacement",
            ACCOUNT_NAME
        );
        return Ok(ShadowOutcome::NotDefault);
    }

    info!(
        "account {} has default password set, replacing with device specific password",
        ACCOUNT_NAME
    );

    let owner = Owner {
        uid: metadata.uid(),
        gid: metadata.gid(),
    };
    let mode = metadata.mode() & 0o7777;

    let backup = config.shadow_backup_path();
    info!("writing {}", backup.display());
    write_synced(&backup, &buffer, owner, mode)?;

    let mut replaced = Vec::with_capacity(buffer.len() + record.encrypted_password.len());
    replaced.extend_from_slice(&buffer[..field.start]);
    replaced.extend_from_slice(&record.encrypted_password);
    replaced.extend_from_slice(&buffer[field.end..]);

    let tmp = config.shadow_tmp_path();
    info!("writing {}", tmp.display());
    write_synced(&tmp, &replaced, owner, mode)?;

    info!("renaming {} to {}", tmp.display(), path.display());
    fs::rename(&tmp, path)
        .with_context(|| format!("could not rename {} to {}", tmp.display(), path.display()))?;

    Ok(ShadowOutcome::Replaced)
}
