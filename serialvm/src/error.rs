//! Error types for serialvm operations.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, serialvm::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while provisioning, configuring, or running the VM.
///
/// Every variant is terminal: a half-configured VM is never started.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The command line did not carry exactly one image path.
    #[error("{0}")]
    Usage(String),

    /// An existing bundle is missing an artifact or holds a malformed one.
    #[error("bundle {}: {reason}", path.display())]
    BundleIntegrity {
        /// Path of the offending artifact.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// A disk image, identity record, firmware store, or device attachment
    /// could not be created.
    #[error("failed to create {what} at {}: {source}", path.display())]
    ResourceCreation {
        /// Kind of resource being created.
        what: &'static str,
        /// Path the resource lives at.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// The assembled configuration violates the hypervisor's limits.
    #[error("invalid virtual machine configuration: {0}")]
    Validation(String),

    /// The hypervisor rejected or failed the start request.
    #[error("failed to start the virtual machine: {0}")]
    Start(String),

    /// The guest stopped abnormally after a successful start.
    #[error("virtual machine stopped with an error: {0}")]
    Guest(String),

    /// A launch step was invoked from the wrong state.
    #[error("cannot {step} while {state}")]
    State {
        /// The step that was attempted.
        step: &'static str,
        /// The state the launcher was in.
        state: crate::launch::State,
    },

    /// An I/O error outside resource creation.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Builds a [`Error::ResourceCreation`] for `what` at `path`.
    pub(crate) fn create(what: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ResourceCreation {
            what,
            path: path.into(),
            source,
        }
    }

    /// Builds a [`Error::BundleIntegrity`] for the artifact at `path`.
    pub(crate) fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::BundleIntegrity {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
