//! In-process hypervisor used by unit tests.

use std::fs;
use std::path::Path;

use crate::config::{VariableStore, VmConfig};
use crate::hypervisor::{Hypervisor, Machine};
use crate::policy::{GIB, Limits};
use crate::topology::DiskAttachment;
use crate::{Error, Result};

/// Hypervisor that records what it is asked to do.
#[derive(Debug, Default)]
pub(crate) struct FakeHypervisor {
    /// Diagnostic returned by [`FakeMachine::start`], if any.
    pub(crate) start_error: Option<String>,
    /// Diagnostic returned by [`FakeMachine::wait`], if any.
    pub(crate) guest_error: Option<String>,
}

impl Hypervisor for FakeHypervisor {
    type Machine = FakeMachine;

    fn limits(&self) -> Limits {
        Limits::new(1, 64, 512 << 20, 64 * GIB)
    }

    fn create_variable_store(&self, path: &Path) -> Result<VariableStore> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::create("firmware variable store", path, e))?;
        Ok(VariableStore::new(path))
    }

    fn open_variable_store(&self, path: &Path) -> Result<VariableStore> {
        if !path.is_file() {
            return Err(Error::integrity(path, "missing"));
        }
        Ok(VariableStore::new(path))
    }

    fn disk_attachment(&self, path: &Path, read_only: bool) -> Result<DiskAttachment> {
        DiskAttachment::open(path, read_only)
    }

    fn instantiate(&self, config: VmConfig) -> Result<FakeMachine> {
        Ok(FakeMachine {
            config,
            start_error: self.start_error.clone(),
            guest_error: self.guest_error.clone(),
            started: false,
        })
    }
}

/// Machine produced by [`FakeHypervisor`].
#[derive(Debug)]
pub(crate) struct FakeMachine {
    /// Configuration the machine was built from.
    pub(crate) config: VmConfig,
    /// Start failure to report.
    start_error: Option<String>,
    /// Guest failure to report.
    guest_error: Option<String>,
    /// Whether `start` succeeded.
    pub(crate) started: bool,
}

impl Machine for FakeMachine {
    async fn start(&mut self) -> Result<()> {
        if let Some(msg) = self.start_error.take() {
            return Err(Error::Start(msg));
        }
        self.started = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        match self.guest_error.take() {
            Some(msg) => Err(Error::Guest(msg)),
            None => Ok(()),
        }
    }
}
