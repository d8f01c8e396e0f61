//! Mount source resolution.
//!
//! The kernel command line may name the root device by path or by tag
//! (`PARTUUID=`, `UUID=`, `LABEL=`). There is no udev in the initramfs, so
//! MBR `PARTUUID`s are resolved by reading disk signatures directly; the other
//! tags only resolve through `/dev/disk/by-*` links when something created them.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Offset of the 32-bit disk signature in an MBR.
const MBR_SIGNATURE_OFFSET: u64 = 440;

/// A parsed mount source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSpec<'a> {
    Path(&'a Path),
    PartUuid(&'a str),
    Uuid(&'a str),
    Label(&'a str),
}

impl<'a> SourceSpec<'a> {
    pub fn parse(source: &'a str) -> Self {
        if let Some(id) = source.strip_prefix("PARTUUID=") {
            SourceSpec::PartUuid(id)
        } else if let Some(id) = source.strip_prefix("UUID=") {
            SourceSpec::Uuid(id)
        } else if let Some(label) = source.strip_prefix("LABEL=") {
            SourceSpec::Label(label)
        } else {
            SourceSpec::Path(Path::new(source))
        }
    }
}

/// A partition as listed in `/sys/class/block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition device name (`mmcblk0p2`)
    pub name: String,
    /// Whole-disk device name (`mmcblk0`)
    pub disk: String,
    /// Partition number (1-based)
    pub number: u32,
}

/// Snapshot of the block devices present when it was taken.
#[derive(Debug, Clone)]
pub struct BlockDevices {
    dev_dir: PathBuf,
    partitions: Vec<Partition>,
}

impl BlockDevices {
    /// Read the partition list from `sys_block`. A missing directory means no devices.
    pub fn scan(sys_block: &Path, dev_dir: &Path) -> io::Result<Self> {
        let mut partitions = Vec::new();

        let entries = match fs::read_dir(sys_block) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    dev_dir: dev_dir.to_path_buf(),
                    partitions,
                })
            }
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            let number = match fs::read_to_string(path.join("partition")) {
                Ok(s) => match s.trim().parse::<u32>() {
                    Ok(n) => n,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };

            // /sys/class/block/<part> links into .../<disk>/<part>
            let disk = fs::canonicalize(&path)
                .ok()
                .and_then(|p| {
                    p.parent()
                        .and_then(|d| d.file_name())
                        .map(|d| d.to_string_lossy().into_owned())
                });

            if let Some(disk) = disk {
                partitions.push(Partition {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    disk,
                    number,
                });
            }
        }

        partitions.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            dev_dir: dev_dir.to_path_buf(),
            partitions,
        })
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Device node for `source`, or `None` if it does not exist yet.
    pub fn resolve(&self, source: &str) -> Option<PathBuf> {
        match SourceSpec::parse(source) {
            SourceSpec::Path(path) => path.exists().then(|| path.to_path_buf()),
            SourceSpec::PartUuid(id) => self
                .by_link("by-partuuid", id)
                .or_else(|| self.find_mbr_partuuid(id)),
            SourceSpec::Uuid(id) => self.by_link("by-uuid", id),
            SourceSpec::Label(label) => self.by_link("by-label", label),
        }
    }

    fn by_link(&self, kind: &str, value: &str) -> Option<PathBuf> {
        let link = self.dev_dir.join("disk").join(kind).join(value);
        link.exists().then_some(link)
    }

    /// MBR PARTUUIDs are `<disk signature as 8 hex digits>-<partition number as 2 hex digits>`.
    fn find_mbr_partuuid(&self, id: &str) -> Option<PathBuf> {
        let (signature, number) = id.split_once('-')?;
        if signature.len() != 8 || number.len() != 2 {
            return None;
        }
        let signature = u32::from_str_radix(signature, 16).ok()?;
        let number = u32::from_str_radix(number, 16).ok()?;

        self.partitions
            .iter()
            .filter(|p| p.number == number)
            .find(|p| read_mbr_signature(&self.dev_dir.join(&p.disk)).ok() == Some(signature))
            .map(|p| self.dev_dir.join(&p.name))
            .filter(|node| node.exists())
    }
}

/// Read the little-endian disk signature from an MBR.
pub fn read_mbr_signature(disk: &Path) -> io::Result<u32> {
    let mut file = File::open(disk)?;
    let mut bytes = [0u8; 4];

    file.seek(SeekFrom::Start(MBR_SIGNATURE_OFFSET))?;
    file.read_exact(&mut bytes)?;

    Ok(u32::from_le_bytes(bytes))
}
