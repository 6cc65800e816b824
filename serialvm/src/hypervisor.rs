//! Boundary to the host virtualization capability.
//!
//! The core never talks to a hypervisor directly: it asks a [`Hypervisor`]
//! for its limits, for firmware stores and disk attachments, and finally
//! hands it a validated [`VmConfig`] to turn into a [`Machine`].

use std::fmt;
use std::future::Future;
use std::path::Path;

use crate::Result;
use crate::config::{VariableStore, VmConfig};
use crate::policy::Limits;
use crate::topology::DiskAttachment;

/// A host-provided virtualization backend.
pub trait Hypervisor {
    /// The VM handle produced by [`Hypervisor::instantiate`].
    type Machine: Machine;

    /// Resource bounds every configuration must respect.
    fn limits(&self) -> Limits;

    /// Creates an initialized, empty firmware variable store at `path`.
    ///
    /// Must fail if `path` already exists.
    fn create_variable_store(&self, path: &Path) -> Result<VariableStore>;

    /// Locates the firmware variable store at `path` without modifying it.
    fn open_variable_store(&self, path: &Path) -> Result<VariableStore>;

    /// Creates a disk-image attachment for `path`.
    fn disk_attachment(&self, path: &Path, read_only: bool) -> Result<DiskAttachment>;

    /// Checks `config` against this hypervisor's limits.
    fn validate(&self, config: &VmConfig) -> Result<()> {
        config.validate(&self.limits())
    }

    /// Builds a VM handle from a validated configuration.
    fn instantiate(&self, config: VmConfig) -> Result<Self::Machine>;
}

/// A single VM instance owned by the launcher.
pub trait Machine: fmt::Debug {
    /// Requests the VM to start.
    ///
    /// Resolves once the hypervisor reports the outcome of the start
    /// request. An error carries the hypervisor's diagnostic text.
    fn start(&mut self) -> impl Future<Output = Result<()>>;

    /// Resolves when the guest stops.
    ///
    /// `Ok` means a clean guest-initiated shutdown.
    fn wait(&mut self) -> impl Future<Output = Result<()>>;
}
