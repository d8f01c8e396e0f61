//! Kernel module loading.
//!
//! A small modprobe: looks the module up in `modules.dep` of the running
//! kernel's release on the staged root, loads its dependencies and then the
//! module itself with finit_module(2). Built-in and already loaded modules are
//! left alone. Module names treat `-` and `_` as the same character.

use anyhow::{anyhow, bail, Context, Result};
use std::ffi::CStr;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::info;

/// finit_module flag: the kernel decompresses the image itself.
const MODULE_INIT_COMPRESSED_FILE: libc::c_uint = 4;

/// Loads kernel modules by name.
pub trait ModuleLoader {
    fn load(&self, name: &str) -> Result<()>;
}

/// Module name as the kernel reports it: file stem with `-` folded to `_`.
pub fn normalize(name: &str) -> String {
    name.replace('-', "_")
}

/// Module name for a `modules.dep` path (`kernel/drivers/i2c/i2c-dev.ko.xz` -> `i2c_dev`).
pub fn module_name(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let stem = file
        .strip_suffix(".ko")
        .or_else(|| file.strip_suffix(".ko.xz"))
        .or_else(|| file.strip_suffix(".ko.gz"))
        .or_else(|| file.strip_suffix(".ko.zst"))?;
    Some(normalize(stem))
}

fn is_compressed(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("xz") | Some("gz") | Some("zst")
    )
}

/// Files to load for one module, dependencies first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Compiled into the kernel
    Builtin,
    /// Module files relative to the release directory
    Files(Vec<String>),
}

/// Module tree of one kernel release.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    release_dir: PathBuf,
}

impl ModuleTree {
    pub fn new(release_dir: impl Into<PathBuf>) -> Self {
        Self {
            release_dir: release_dir.into(),
        }
    }

    pub fn release_dir(&self) -> &Path {
        &self.release_dir
    }

    /// Look `name` up in `modules.builtin` and `modules.dep`.
    pub fn resolve(&self, name: &str) -> Result<Resolution> {
        let wanted = normalize(name);

        let builtin_path = self.release_dir.join("modules.builtin");
        if let Ok(builtin) = fs::read_to_string(&builtin_path) {
            if builtin.lines().filter_map(module_name).any(|m| m == wanted) {
                return Ok(Resolution::Builtin);
            }
        }

        let dep_path = self.release_dir.join("modules.dep");
        let deps = fs::read_to_string(&dep_path)
            .with_context(|| format!("could not read {}", dep_path.display()))?;

        for line in deps.lines() {
            let Some((module, requires)) = line.split_once(':') else {
                continue;
            };
            if module_name(module).as_deref() != Some(wanted.as_str()) {
                continue;
            }

            // modules.dep lists the deepest dependency last
            let mut files: Vec<String> = requires
                .split_whitespace()
                .rev()
                .map(str::to_string)
                .collect();
            files.push(module.trim().to_string());
            return Ok(Resolution::Files(files));
        }

        bail!("kernel module {} is missing", name)
    }
}

/// Loads modules from the staged root into the running kernel.
pub struct Modprobe {
    tree: ModuleTree,
    sys_module_dir: PathBuf,
}

impl Modprobe {
    /// Loader for the running kernel's release under `modules_dir`.
    pub fn for_running_kernel(modules_dir: &Path, sys_module_dir: &Path) -> Result<Self> {
        let release = kernel_release().context("could not get kernel release")?;
        Ok(Self::new(ModuleTree::new(modules_dir.join(release)), sys_module_dir))
    }

    pub fn new(tree: ModuleTree, sys_module_dir: &Path) -> Self {
        Self {
            tree,
            sys_module_dir: sys_module_dir.to_path_buf(),
        }
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.sys_module_dir.join(name).exists()
    }

    fn insert(&self, relative: &str) -> Result<()> {
        let path = self.tree.release_dir().join(relative);
        let name = module_name(relative)
            .ok_or_else(|| anyhow!("invalid module path {}", relative))?;

        if self.is_loaded(&name) {
            return Ok(());
        }

        let file = File::open(&path).with_context(|| format!("could not open {}", path.display()))?;
        let flags = if is_compressed(&path) {
            MODULE_INIT_COMPRESSED_FILE
        } else {
            0
        };
        let params = b"\0";

        // SAFETY: fd is open for the call's duration, params is NUL-terminated.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_finit_module,
                file.as_raw_fd(),
                params.as_ptr() as *const libc::c_char,
                flags,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err).with_context(|| format!("could not load {}", path.display()));
            }
        }

        Ok(())
    }
}

impl ModuleLoader for Modprobe {
    fn load(&self, name: &str) -> Result<()> {
        info!("loading kernel module {}", name);

        if self.is_loaded(&normalize(name)) {
            return Ok(());
        }

        match self
            .tree
            .resolve(name)
            .with_context(|| format!("could not lookup kernel module {}", name))?
        {
            Resolution::Builtin => Ok(()),
            Resolution::Files(files) => {
                for file in &files {
                    self.insert(file)
                        .with_context(|| format!("could not load kernel module {}", name))?;
                }
                Ok(())
            }
        }
    }
}

/// `uname -r`.
pub fn kernel_release() -> io::Result<String> {
    // SAFETY: utsname is plain old data; uname fills it in.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };

    // SAFETY: uts is a valid, writable utsname.
    if unsafe { libc::uname(&mut uts) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the kernel NUL-terminates release.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}
