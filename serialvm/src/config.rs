//! Virtual machine configuration handed to the hypervisor.

use std::path::{Path, PathBuf};

use crate::console::SerialAttachment;
use crate::identity::MachineIdentity;
use crate::policy::Limits;
use crate::topology::Device;
use crate::{Error, Result};

/// Memory sizes must be a whole number of these.
const MIB: u64 = 1024 * 1024;

/// A firmware variable store located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableStore {
    /// Path of the NVRAM blob.
    path: PathBuf,
}

impl VariableStore {
    /// Wraps an existing store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the NVRAM blob.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Boot loader of the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BootLoader {
    /// UEFI firmware backed by a persistent variable store.
    Efi(VariableStore),
}

/// Platform identity of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Platform {
    /// Identifier that stays stable across boots.
    pub identity: MachineIdentity,
}

impl Platform {
    /// Creates a generic platform with the given identity.
    pub const fn new(identity: MachineIdentity) -> Self {
        Self { identity }
    }
}

/// Everything the hypervisor needs to run the guest.
#[derive(Debug)]
#[non_exhaustive]
pub struct VmConfig {
    /// Number of virtual CPUs.
    pub cpus: usize,
    /// Guest memory in bytes.
    pub memory: u64,
    /// Platform identity.
    pub platform: Platform,
    /// Boot loader and firmware.
    pub boot_loader: BootLoader,
    /// Devices in attachment order.
    pub devices: Vec<Device>,
}

impl VmConfig {
    /// Assembles a configuration.
    pub const fn new(
        cpus: usize,
        memory: u64,
        platform: Platform,
        boot_loader: BootLoader,
        devices: Vec<Device>,
    ) -> Self {
        Self {
            cpus,
            memory,
            platform,
            boot_loader,
            devices,
        }
    }

    /// Binds `attachment` as the transport of the serial console.
    pub fn bind_serial(&mut self, attachment: SerialAttachment) -> Result<()> {
        let slot = self
            .devices
            .iter_mut()
            .find_map(|d| match d {
                Device::Serial(slot) => Some(slot),
                _ => None,
            })
            .ok_or_else(|| Error::Validation("no serial console device".into()))?;
        *slot = Some(attachment);
        Ok(())
    }

    /// Checks this configuration against `limits`.
    pub fn validate(&self, limits: &Limits) -> Result<()> {
        if !(limits.min_cpus..=limits.max_cpus).contains(&self.cpus) {
            return Err(Error::Validation(format!(
                "{} vCPUs outside the allowed range {}..={}",
                self.cpus, limits.min_cpus, limits.max_cpus
            )));
        }
        if !(limits.min_memory..=limits.max_memory).contains(&self.memory) {
            return Err(Error::Validation(format!(
                "{} bytes of memory outside the allowed range {}..={}",
                self.memory, limits.min_memory, limits.max_memory
            )));
        }
        if self.memory % MIB != 0 {
            return Err(Error::Validation(format!(
                "memory size {} is not a multiple of 1 MiB",
                self.memory
            )));
        }

        let count = |pred: fn(&Device) -> bool| self.devices.iter().filter(|d| pred(d)).count();

        if count(Device::is_storage) == 0 {
            return Err(Error::Validation("no storage device".into()));
        }
        if count(|d| matches!(d, Device::Network(_))) > 1 {
            return Err(Error::Validation("more than one network device".into()));
        }
        match count(|d| matches!(d, Device::Serial(_))) {
            1 => {}
            n => {
                return Err(Error::Validation(format!(
                    "expected exactly one serial console, found {n}"
                )));
            }
        }
        if self
            .devices
            .iter()
            .any(|d| matches!(d, Device::Serial(None)))
        {
            return Err(Error::Validation("serial console has no transport".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::GIB;
    use crate::topology::{DiskAttachment, NetworkAttachment};

    const LIMITS: Limits = Limits::new(1, 4, 256 * MIB, 8 * GIB);

    fn config(devices: Vec<Device>) -> VmConfig {
        VmConfig::new(
            2,
            4 * GIB,
            Platform::new(MachineIdentity::generate()),
            BootLoader::Efi(VariableStore::new("/bundle/nvram.fd")),
            devices,
        )
    }

    fn disk() -> Device {
        Device::BlockStorage(DiskAttachment::new("/bundle/disk.img", false))
    }

    #[test]
    fn accepts_bound_console() {
        let mut cfg = config(vec![
            disk(),
            Device::Network(NetworkAttachment::Nat),
            Device::Serial(None),
        ]);
        assert!(matches!(cfg.validate(&LIMITS), Err(Error::Validation(_))));

        cfg.bind_serial(SerialAttachment::detached().unwrap()).unwrap();
        cfg.validate(&LIMITS).unwrap();
    }

    #[test]
    fn rejects_out_of_range_resources() {
        let mut cfg = config(vec![disk(), Device::Serial(None)]);
        cfg.bind_serial(SerialAttachment::detached().unwrap()).unwrap();

        cfg.cpus = 5;
        assert!(cfg.validate(&LIMITS).is_err());
        cfg.cpus = 4;
        cfg.memory = 9 * GIB;
        assert!(cfg.validate(&LIMITS).is_err());
        cfg.memory = GIB + 1;
        assert!(cfg.validate(&LIMITS).is_err());
        cfg.memory = GIB;
        cfg.validate(&LIMITS).unwrap();
    }

    #[test]
    fn requires_exactly_one_serial_console() {
        let mut none = config(vec![disk()]);
        assert!(none.validate(&LIMITS).is_err());
        assert!(none.bind_serial(SerialAttachment::detached().unwrap()).is_err());

        let mut two = config(vec![disk(), Device::Serial(None), Device::Serial(None)]);
        two.bind_serial(SerialAttachment::detached().unwrap()).unwrap();
        assert!(two.validate(&LIMITS).is_err());
    }

    #[test]
    fn requires_storage() {
        let mut cfg = config(vec![Device::Serial(None)]);
        cfg.bind_serial(SerialAttachment::detached().unwrap()).unwrap();
        assert!(cfg.validate(&LIMITS).is_err());
    }
}
