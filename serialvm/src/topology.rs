//! Device topology for a single launch.
//!
//! The device list is rebuilt on every run and never persisted. Storage
//! comes first, installer media ahead of the primary disk, followed by the
//! fixed set of network, audio, input and console devices.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};
use crate::console::SerialAttachment;
use crate::hypervisor::Hypervisor;

/// A disk image attached to a storage device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    /// Image path on the host.
    path: PathBuf,
    /// Whether the guest may write to the image.
    read_only: bool,
}

impl DiskAttachment {
    /// Describes an attachment of the image at `path`.
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
        }
    }

    /// Opens `path` with the requested access to make sure the hypervisor
    /// will be able to, and describes an attachment of its absolute path.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let fail = |e| Error::create("disk attachment", path, e);
        fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(fail)?;
        let absolute = std::path::absolute(path).map_err(fail)?;
        Ok(Self::new(absolute, read_only))
    }

    /// Image path on the host.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the guest may write to the image.
    pub const fn read_only(&self) -> bool {
        self.read_only
    }
}

/// How the guest reaches the outside network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetworkAttachment {
    /// Outbound traffic is NATed through the host.
    Nat,
}

/// One device of the guest.
#[derive(Debug)]
#[non_exhaustive]
pub enum Device {
    /// Virtio block device.
    BlockStorage(DiskAttachment),
    /// USB mass storage device.
    UsbMassStorage(DiskAttachment),
    /// Network interface.
    Network(NetworkAttachment),
    /// Sound input fed from host audio capture.
    AudioInput,
    /// Sound output played on the host.
    AudioOutput,
    /// USB keyboard.
    Keyboard,
    /// USB pointing device reporting absolute coordinates.
    Pointer,
    /// Serial console; the transport is bound by the console bridge.
    Serial(Option<SerialAttachment>),
}

impl Device {
    /// Returns `true` for block and USB storage.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::BlockStorage(_) | Self::UsbMassStorage(_))
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BlockStorage(_) => "block-storage",
            Self::UsbMassStorage(_) => "usb-mass-storage",
            Self::Network(_) => "network",
            Self::AudioInput => "audio-in",
            Self::AudioOutput => "audio-out",
            Self::Keyboard => "keyboard",
            Self::Pointer => "pointer",
            Self::Serial(_) => "serial",
        }
    }
}

/// Where the guest boots from on this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Boot<'a> {
    /// Fresh install: the installer image is attached read-only.
    Installer(&'a Path),
    /// Resume from the already-installed primary disk.
    Disk,
}

/// Builds the ordered device list.
///
/// Any attachment failure aborts the whole build; no partial list is
/// returned.
pub fn build<H: Hypervisor>(hypervisor: &H, boot: Boot<'_>, primary: &Path) -> Result<Vec<Device>> {
    let mut devices = Vec::with_capacity(8);

    if let Boot::Installer(media) = boot {
        let installer = hypervisor.disk_attachment(media, true)?;
        devices.push(Device::UsbMassStorage(installer));
    }
    devices.push(Device::BlockStorage(
        hypervisor.disk_attachment(primary, false)?,
    ));

    devices.extend([
        Device::Network(NetworkAttachment::Nat),
        Device::AudioInput,
        Device::AudioOutput,
        Device::Keyboard,
        Device::Pointer,
        Device::Serial(None),
    ]);

    debug!(
        devices = ?devices.iter().map(Device::kind).collect::<Vec<_>>(),
        "device topology built"
    );
    Ok(devices)
}
