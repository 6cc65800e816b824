//! Persistent VM bundle on disk.
//!
//! # Layout
//!
//! ```text
//! {bundle}/
//!   disk.img      primary disk, 64 GiB logical size, sparse
//!   machine-id    16-byte machine identity
//!   nvram.fd      firmware variable store
//! ```
//!
//! Whether the bundle directory exists is the only thing that decides
//! between a fresh install and a resume. Provisioning is not atomic: an
//! interrupted install leaves a bundle that [`Bundle::open`] rejects.

use std::path::{Path, PathBuf};
use std::{fs, io};

use tracing::info;

use crate::config::VariableStore;
use crate::hypervisor::Hypervisor;
use crate::identity::MachineIdentity;
use crate::policy::GIB;
use crate::{Error, Result};

/// Logical size of the primary disk image.
pub const DISK_SIZE: u64 = 64 * GIB;

/// File name of the primary disk image.
const DISK_FILE: &str = "disk.img";
/// File name of the machine identity.
const IDENTITY_FILE: &str = "machine-id";
/// File name of the firmware variable store.
const NVRAM_FILE: &str = "nvram.fd";

/// Whether a bundle is already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Presence {
    /// No bundle yet; the guest must be installed.
    Fresh,
    /// A bundle exists; the guest resumes from its disk.
    Existing,
}

/// Artifacts of a provisioned or reopened bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Artifacts {
    /// Machine identity.
    pub identity: MachineIdentity,
    /// Firmware variable store.
    pub variable_store: VariableStore,
    /// Primary disk image path.
    pub disk: PathBuf,
}

/// A VM bundle directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Bundle directory.
    root: PathBuf,
}

impl Bundle {
    /// Refers to the bundle at `root`; nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Bundle directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the primary disk image.
    pub fn disk_path(&self) -> PathBuf {
        self.root.join(DISK_FILE)
    }

    /// Path of the machine identity.
    pub fn identity_path(&self) -> PathBuf {
        self.root.join(IDENTITY_FILE)
    }

    /// Path of the firmware variable store.
    pub fn nvram_path(&self) -> PathBuf {
        self.root.join(NVRAM_FILE)
    }

    /// Reports whether the bundle directory exists.
    pub fn detect(&self) -> Presence {
        if self.root.exists() {
            Presence::Existing
        } else {
            Presence::Fresh
        }
    }

    /// Creates the bundle and all of its artifacts.
    ///
    /// Fails if the bundle already exists or its parent directory is
    /// missing. Nothing is cleaned up on failure.
    pub fn provision<H: Hypervisor>(&self, hypervisor: &H) -> Result<Artifacts> {
        fs::create_dir(&self.root).map_err(|e| Error::create("bundle", &self.root, e))?;

        let disk = self.disk_path();
        create_disk_image(&disk, DISK_SIZE).map_err(|e| Error::create("disk image", &disk, e))?;

        let identity = MachineIdentity::generate();
        identity.create(&self.identity_path())?;

        let variable_store = hypervisor.create_variable_store(&self.nvram_path())?;

        info!(bundle = %self.root.display(), %identity, "provisioned new bundle");
        Ok(Artifacts {
            identity,
            variable_store,
            disk,
        })
    }

    /// Reopens an existing bundle without regenerating anything.
    pub fn open<H: Hypervisor>(&self, hypervisor: &H) -> Result<Artifacts> {
        let identity = MachineIdentity::load(&self.identity_path())?;

        let nvram = self.nvram_path();
        if !nvram.is_file() {
            return Err(Error::integrity(nvram, "firmware variable store is missing"));
        }
        let variable_store = hypervisor.open_variable_store(&nvram)?;

        let disk = self.disk_path();
        match fs::metadata(&disk) {
            Ok(m) if m.is_file() && m.len() == DISK_SIZE => {}
            Ok(m) if m.is_file() => {
                return Err(Error::integrity(
                    disk,
                    format!("disk image is {} bytes, expected {DISK_SIZE}", m.len()),
                ));
            }
            Ok(_) => return Err(Error::integrity(disk, "disk image is not a file")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::integrity(disk, "disk image is missing"));
            }
            Err(e) => return Err(Error::integrity(disk, format!("unreadable: {e}"))),
        }

        info!(bundle = %self.root.display(), %identity, "opened existing bundle");
        Ok(Artifacts {
            identity,
            variable_store,
            disk,
        })
    }
}

/// Creates a new sparse file of `size` bytes at `path`.
fn create_disk_image(path: &Path, size: u64) -> io::Result<()> {
    let f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    f.set_len(size)?;
    f.sync_all()
}
