//! Persistent machine identity.

use std::fmt;
use std::path::Path;
use std::{fs, io};

use uuid::Uuid;

use crate::{Error, Result};

/// Opaque identifier naming the VM to the hypervisor across boots.
///
/// The on-disk form is exactly [`MachineIdentity::LEN`] bytes: a random
/// UUID in big-endian byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineIdentity(Uuid);

impl MachineIdentity {
    /// Length of the persisted representation.
    pub const LEN: usize = 16;

    /// Generates a fresh identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the persisted representation.
    ///
    /// Returns `None` when `bytes` has the wrong length or is all zeroes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let id = Uuid::from_slice(bytes).ok()?;
        (!id.is_nil()).then_some(Self(id))
    }

    /// Returns the persisted representation.
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }

    /// Writes the identity to a new file at `path`; never overwrites.
    pub(crate) fn create(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let write = || -> io::Result<()> {
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?;
            f.write_all(self.as_bytes())?;
            f.sync_all()
        };
        write().map_err(|e| Error::create("machine identity", path, e))
    }

    /// Reads the identity persisted at `path`.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::integrity(path, "machine identity is missing"));
            }
            Err(e) => return Err(Error::integrity(path, format!("unreadable: {e}"))),
        };
        Self::from_bytes(&bytes).ok_or_else(|| {
            Error::integrity(
                path,
                format!("malformed machine identity ({} bytes)", bytes.len()),
            )
        })
    }
}

impl fmt::Display for MachineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_identities_differ() {
        assert_ne!(MachineIdentity::generate(), MachineIdentity::generate());
    }

    #[test]
    fn rejects_wrong_length_and_nil() {
        assert!(MachineIdentity::from_bytes(&[7; 15]).is_none());
        assert!(MachineIdentity::from_bytes(&[7; 17]).is_none());
        assert!(MachineIdentity::from_bytes(&[0; 16]).is_none());
        assert!(MachineIdentity::from_bytes(&[7; 16]).is_some());
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");

        let id = MachineIdentity::generate();
        id.create(&path).unwrap();
        assert_eq!(MachineIdentity::load(&path).unwrap(), id);

        let err = MachineIdentity::generate().create(&path).unwrap_err();
        assert!(matches!(err, Error::ResourceCreation { .. }));
        assert_eq!(MachineIdentity::load(&path).unwrap(), id);
    }

    #[test]
    fn truncated_file_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        fs::write(&path, [1, 2, 3]).unwrap();

        let err = MachineIdentity::load(&path).unwrap_err();
        assert!(matches!(err, Error::BundleIntegrity { .. }), "{err}");
    }

    #[test]
    fn displays_as_hyphenated_uuid() {
        let id = MachineIdentity::from_bytes(&[0xab; 16]).unwrap();
        assert_eq!(id.to_string(), "abababab-abab-abab-abab-abababababab");
    }
}
