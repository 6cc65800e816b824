//! One-shot launch state machine.
//!
//! A [`Launcher`] owns everything needed for a single VM run: the
//! hypervisor, the bundle, the installer path, the assembled configuration
//! and, once started, the machine handle. Each step is a separate fallible
//! method so it can be driven and inspected on its own; a failing step
//! leaves the launcher in [`State::Failed`]. No state is ever re-entered.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::bundle::{Bundle, Presence};
use crate::config::{BootLoader, Platform, VmConfig};
use crate::console::SerialAttachment;
use crate::hypervisor::{Hypervisor, Machine};
use crate::topology::{self, Boot};
use crate::{Error, Result, policy};

/// Launch progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    /// Nothing has been looked at yet.
    Uninitialized,
    /// No bundle exists; the guest will be installed.
    FreshInstall,
    /// A bundle exists; the guest resumes from disk.
    Resume,
    /// The configuration is assembled.
    Configured,
    /// The configuration passed validation.
    Starting,
    /// The hypervisor reported a successful start.
    Running,
    /// A step failed; the launch is over.
    Failed,
    /// The guest stopped or the launcher was told to stop it.
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::FreshInstall => "preparing a fresh install",
            Self::Resume => "preparing to resume",
            Self::Configured => "configured",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        })
    }
}

/// Drives a single VM from bundle detection to guest shutdown.
#[derive(Debug)]
pub struct Launcher<H: Hypervisor> {
    /// Backend that runs the guest.
    hypervisor: H,
    /// Persistent bundle.
    bundle: Bundle,
    /// Installer image, attached only on a fresh install.
    installer: PathBuf,
    /// Logical cores used by the sizing policy.
    host_cores: usize,
    /// Current state.
    state: State,
    /// Assembled configuration, until it is handed to the hypervisor.
    config: Option<VmConfig>,
    /// The running machine.
    machine: Option<H::Machine>,
}

impl<H: Hypervisor> Launcher<H> {
    /// Creates a launcher for `bundle`, installing from `installer` if needed.
    pub fn new(hypervisor: H, bundle: Bundle, installer: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor,
            bundle,
            installer: installer.into(),
            host_cores: policy::host_cores(),
            state: State::Uninitialized,
            config: None,
            machine: None,
        }
    }

    /// Overrides the host core count fed to the sizing policy.
    #[must_use]
    pub const fn with_host_cores(mut self, cores: usize) -> Self {
        self.host_cores = cores;
        self
    }

    /// Current state.
    pub const fn state(&self) -> State {
        self.state
    }

    /// The assembled configuration, until [`Launcher::start`] consumes it.
    pub const fn config(&self) -> Option<&VmConfig> {
        self.config.as_ref()
    }

    /// The machine handle, once started.
    pub const fn machine(&self) -> Option<&H::Machine> {
        self.machine.as_ref()
    }

    /// Decides between a fresh install and a resume.
    pub fn detect(&mut self) -> Result<Presence> {
        self.require("detect the bundle", State::Uninitialized)?;
        let presence = self.bundle.detect();
        self.transition(match presence {
            Presence::Fresh => State::FreshInstall,
            Presence::Existing => State::Resume,
        });
        Ok(presence)
    }

    /// Provisions or reopens the bundle and assembles the configuration.
    pub fn configure(&mut self) -> Result<&VmConfig> {
        if !matches!(self.state, State::FreshInstall | State::Resume) {
            return Err(self.out_of_order("configure the machine"));
        }
        let config = self.settle(self.assemble())?;
        self.transition(State::Configured);
        let config: &VmConfig = self.config.insert(config);
        Ok(config)
    }

    /// Binds the serial console transport.
    pub fn bind_console(&mut self, attachment: SerialAttachment) -> Result<()> {
        self.require("bind the console", State::Configured)?;
        let result = match self.config.as_mut() {
            Some(config) => config.bind_serial(attachment),
            None => Err(self.out_of_order("bind the console")),
        };
        self.settle(result)
    }

    /// Validates the configuration against the hypervisor's limits.
    pub fn validate(&mut self) -> Result<()> {
        self.require("validate the configuration", State::Configured)?;
        let result = match self.config.as_ref() {
            Some(config) => self.hypervisor.validate(config),
            None => Err(self.out_of_order("validate the configuration")),
        };
        self.settle(result)?;
        self.transition(State::Starting);
        Ok(())
    }

    /// Hands the configuration to the hypervisor and starts the guest.
    pub async fn start(&mut self) -> Result<()> {
        self.require("start the machine", State::Starting)?;
        let Some(config) = self.config.take() else {
            return Err(self.out_of_order("start the machine"));
        };
        info!(
            cpus = config.cpus,
            memory_mib = config.memory >> 20,
            identity = %config.platform.identity,
            "starting virtual machine"
        );
        let mut machine = self.settle(self.hypervisor.instantiate(config))?;
        let started = machine.start().await;
        self.machine = Some(machine);
        self.settle(started)?;
        self.transition(State::Running);
        Ok(())
    }

    /// Runs every step from detection through start.
    ///
    /// `console` is called once the configuration is assembled, so the
    /// terminal is only taken over when there is a guest to hand it to.
    pub async fn boot<F>(&mut self, console: F) -> Result<()>
    where
        F: FnOnce() -> Result<SerialAttachment>,
    {
        self.detect()?;
        self.configure()?;
        let attachment = self.settle(console())?;
        self.bind_console(attachment)?;
        self.validate()?;
        self.start().await
    }

    /// Blocks until the guest stops.
    pub async fn wait(&mut self) -> Result<()> {
        self.require("wait for the machine", State::Running)?;
        let result = match self.machine.as_mut() {
            Some(machine) => machine.wait().await,
            None => return Err(self.out_of_order("wait for the machine")),
        };
        if result.is_ok() {
            info!("guest shut down");
            self.transition(State::Terminated);
        }
        self.settle(result)
    }

    /// Tears down the guest after an external termination request.
    pub fn terminate(&mut self) {
        info!(state = %self.state, "terminating");
        self.machine = None;
        self.config = None;
        self.transition(State::Terminated);
    }

    /// Builds the configuration for the current branch.
    fn assemble(&self) -> Result<VmConfig> {
        let (artifacts, boot) = if self.state == State::FreshInstall {
            let artifacts = self.bundle.provision(&self.hypervisor)?;
            (artifacts, Boot::Installer(&self.installer))
        } else {
            (self.bundle.open(&self.hypervisor)?, Boot::Disk)
        };

        let limits = self.hypervisor.limits();
        let cpus = policy::cpu_count(self.host_cores, &limits);
        let memory = policy::memory_size(&limits);
        let devices = topology::build(&self.hypervisor, boot, &artifacts.disk)?;

        Ok(VmConfig::new(
            cpus,
            memory,
            Platform::new(artifacts.identity),
            BootLoader::Efi(artifacts.variable_store),
            devices,
        ))
    }

    /// Fails with [`Error::State`] unless the launcher is in `state`.
    fn require(&self, step: &'static str, state: State) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.out_of_order(step))
        }
    }

    /// Error for a step attempted in the wrong state.
    fn out_of_order(&self, step: &'static str) -> Error {
        Error::State {
            step,
            state: self.state,
        }
    }

    /// Moves to [`State::Failed`] if `result` is an error.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.transition(State::Failed);
        }
        result
    }

    /// Records a state change.
    fn transition(&mut self, to: State) {
        debug!(from = %self.state, to = %to, "launch state");
        self.state = to;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::bundle::DISK_SIZE;
    use crate::testing::FakeHypervisor;
    use crate::topology::Device;

    struct Fixture {
        _dir: tempfile::TempDir,
        bundle: Bundle,
        iso: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("install.iso");
        fs::write(&iso, b"installer").unwrap();
        Fixture {
            bundle: Bundle::new(dir.path().join("Test.bundle")),
            iso,
            _dir: dir,
        }
    }

    fn launcher(fx: &Fixture, hv: FakeHypervisor) -> Launcher<FakeHypervisor> {
        Launcher::new(hv, fx.bundle.clone(), &fx.iso).with_host_cores(4)
    }

    fn kinds(config: &VmConfig) -> Vec<&'static str> {
        config.devices.iter().map(Device::kind).collect()
    }

    #[tokio::test]
    async fn first_run_installs_and_reaches_starting() {
        let fx = fixture();
        let mut l = launcher(&fx, FakeHypervisor::default());

        assert_eq!(l.detect().unwrap(), Presence::Fresh);
        assert_eq!(l.state(), State::FreshInstall);

        let config = l.configure().unwrap();
        assert_eq!(config.cpus, 3);
        assert_eq!(config.memory, 4 << 30);
        assert_eq!(
            kinds(config),
            [
                "usb-mass-storage",
                "block-storage",
                "network",
                "audio-in",
                "audio-out",
                "keyboard",
                "pointer",
                "serial",
            ]
        );
        assert_eq!(
            fs::metadata(fx.bundle.disk_path()).unwrap().len(),
            64 * 1024 * 1024 * 1024
        );
        assert_eq!(DISK_SIZE, 64 * 1024 * 1024 * 1024);

        l.bind_console(SerialAttachment::detached().unwrap()).unwrap();
        l.validate().unwrap();
        assert_eq!(l.state(), State::Starting);

        l.start().await.unwrap();
        assert_eq!(l.state(), State::Running);
        assert!(l.machine().unwrap().started);

        l.wait().await.unwrap();
        assert_eq!(l.state(), State::Terminated);
    }

    #[tokio::test]
    async fn second_run_resumes_with_same_identity() {
        let fx = fixture();

        let mut first = launcher(&fx, FakeHypervisor::default());
        first
            .boot(|| Ok(SerialAttachment::detached()?))
            .await
            .unwrap();
        let installed = first.machine().unwrap().config.platform.identity;

        let mut second = launcher(&fx, FakeHypervisor::default());
        assert_eq!(second.detect().unwrap(), Presence::Existing);
        assert_eq!(second.state(), State::Resume);

        let config = second.configure().unwrap();
        assert_eq!(config.platform.identity, installed);
        assert_eq!(
            kinds(config),
            [
                "block-storage",
                "network",
                "audio-in",
                "audio-out",
                "keyboard",
                "pointer",
                "serial",
            ]
        );
    }

    #[test]
    fn missing_identity_fails_before_configured() {
        let fx = fixture();
        fx.bundle.provision(&FakeHypervisor::default()).unwrap();
        fs::remove_file(fx.bundle.identity_path()).unwrap();

        let mut l = launcher(&fx, FakeHypervisor::default());
        l.detect().unwrap();
        let err = l.configure().unwrap_err();

        assert!(matches!(err, Error::BundleIntegrity { .. }), "{err}");
        assert_eq!(l.state(), State::Failed);
        assert!(l.config().is_none());
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let fx = fixture();
        let hv = FakeHypervisor {
            start_error: Some("no accelerator".into()),
            ..FakeHypervisor::default()
        };
        let mut l = launcher(&fx, hv);

        let err = l
            .boot(|| Ok(SerialAttachment::detached()?))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Start(ref m) if m == "no accelerator"), "{err}");
        assert_eq!(l.state(), State::Failed);
    }

    #[tokio::test]
    async fn guest_failure_ends_in_failed() {
        let fx = fixture();
        let hv = FakeHypervisor {
            guest_error: Some("exit status 1".into()),
            ..FakeHypervisor::default()
        };
        let mut l = launcher(&fx, hv);
        l.boot(|| Ok(SerialAttachment::detached()?)).await.unwrap();

        assert!(matches!(l.wait().await, Err(Error::Guest(_))));
        assert_eq!(l.state(), State::Failed);
    }

    #[test]
    fn unbound_console_fails_validation() {
        let fx = fixture();
        let mut l = launcher(&fx, FakeHypervisor::default());
        l.detect().unwrap();
        l.configure().unwrap();

        assert!(matches!(l.validate(), Err(Error::Validation(_))));
        assert_eq!(l.state(), State::Failed);
    }

    #[test]
    fn steps_cannot_run_out_of_order() {
        let fx = fixture();
        let mut l = launcher(&fx, FakeHypervisor::default());

        assert!(matches!(l.configure(), Err(Error::State { .. })));
        assert!(matches!(l.validate(), Err(Error::State { .. })));
        assert_eq!(l.state(), State::Uninitialized);
        assert_eq!(fx.bundle.detect(), Presence::Fresh);

        l.detect().unwrap();
        assert!(matches!(l.detect(), Err(Error::State { .. })));
        assert_eq!(l.state(), State::FreshInstall);
    }

    #[tokio::test]
    async fn terminate_stops_a_running_guest() {
        let fx = fixture();
        let mut l = launcher(&fx, FakeHypervisor::default());
        l.boot(|| Ok(SerialAttachment::detached()?)).await.unwrap();

        l.terminate();
        assert_eq!(l.state(), State::Terminated);
        assert!(l.machine().is_none());
        assert!(matches!(l.wait().await, Err(Error::State { .. })));
    }
}
