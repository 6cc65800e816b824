//! Launcher for a single EFI virtual machine with its console on the
//! terminal.
//!
//! `serialvm` keeps one guest in a bundle directory: a 64 GiB sparse disk
//! image, a persistent machine identity, and the firmware's NVRAM. The
//! first run provisions the bundle and boots an installer image; later
//! runs resume from the installed disk. Either way the guest's serial
//! console takes over the launcher's standard input and output.
//!
//! # Quick start
//!
//! ```no_run
//! use serialvm::{Bundle, Launcher, Qemu, Settings, console};
//!
//! # async fn run() -> serialvm::Result<()> {
//! let settings = Settings::from_env()?;
//! let qemu = Qemu::new(&settings)?;
//! let mut launcher = Launcher::new(qemu, Bundle::new(&settings.bundle), "install.iso");
//!
//! launcher.boot(console::take_over_stdio).await?;
//! launcher.wait().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("serialvm requires a Unix host");

mod bundle;
pub mod config;
pub mod console;
mod error;
pub mod hypervisor;
mod identity;
mod launch;
pub mod policy;
mod qemu;
mod settings;
#[cfg(test)]
mod testing;
pub mod topology;

pub use bundle::{Artifacts, Bundle, DISK_SIZE, Presence};
pub use config::VmConfig;
pub use console::SerialAttachment;
pub use error::{Error, Result};
pub use hypervisor::{Hypervisor, Machine};
pub use identity::MachineIdentity;
pub use launch::{Launcher, State};
pub use qemu::{Arch, Qemu, QemuMachine};
pub use settings::{BUNDLE_NAME, Settings};
