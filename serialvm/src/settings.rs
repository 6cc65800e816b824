//! Launcher settings resolved from the environment.
//!
//! | Variable                  | Default                              |
//! |---------------------------|--------------------------------------|
//! | `SERIALVM_BUNDLE`         | `$HOME/SerialVM.bundle`              |
//! | `SERIALVM_QEMU`           | `qemu-system-<host arch>`            |
//! | `SERIALVM_FIRMWARE_CODE`  | first edk2 build found on the host   |
//! | `SERIALVM_FIRMWARE_VARS`  | matching variable store template     |
//! | `SERIALVM_AUDIO`          | `coreaudio` on macOS, `pa` elsewhere |
//!
//! Empty values count as unset.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use crate::Result;

/// Name of the bundle directory under the home directory.
pub const BUNDLE_NAME: &str = "SerialVM.bundle";

/// Resolved launcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Settings {
    /// Bundle directory.
    pub bundle: PathBuf,
    /// QEMU system emulator binary.
    pub qemu: PathBuf,
    /// Explicit UEFI firmware code image.
    pub firmware_code: Option<PathBuf>,
    /// Explicit UEFI variable store template.
    pub firmware_vars: Option<PathBuf>,
    /// QEMU audio backend driver.
    pub audio_driver: String,
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var_os(key), dirs::home_dir())
    }

    /// Resolves settings through `lookup`, with `home` as the default
    /// bundle parent.
    pub fn resolve<F>(lookup: F, home: Option<PathBuf>) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let bundle = match var("SERIALVM_BUNDLE") {
            Some(path) => PathBuf::from(path),
            None => home
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        "cannot determine the home directory; set SERIALVM_BUNDLE",
                    )
                })?
                .join(BUNDLE_NAME),
        };

        let qemu = var("SERIALVM_QEMU").map_or_else(
            || PathBuf::from(format!("qemu-system-{}", std::env::consts::ARCH)),
            PathBuf::from,
        );

        let audio_driver = var("SERIALVM_AUDIO").map_or_else(
            || default_audio_driver().to_owned(),
            |v| v.to_string_lossy().into_owned(),
        );

        Ok(Self {
            bundle,
            qemu,
            firmware_code: var("SERIALVM_FIRMWARE_CODE").map(PathBuf::from),
            firmware_vars: var("SERIALVM_FIRMWARE_VARS").map(PathBuf::from),
            audio_driver,
        })
    }
}

/// Host audio backend QEMU is most likely to have.
const fn default_audio_driver() -> &'static str {
    if cfg!(target_os = "macos") {
        "coreaudio"
    } else {
        "pa"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn resolve(vars: &[(&str, &str)], home: Option<&str>) -> Result<Settings> {
        let env: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), OsString::from(v)))
            .collect();
        Settings::resolve(|k| env.get(k).cloned(), home.map(PathBuf::from))
    }

    #[test]
    fn defaults_live_under_home() {
        let s = resolve(&[], Some("/home/ada")).unwrap();
        assert_eq!(s.bundle, PathBuf::from("/home/ada/SerialVM.bundle"));
        assert!(
            s.qemu
                .to_string_lossy()
                .starts_with("qemu-system-")
        );
        assert_eq!(s.firmware_code, None);
        assert_eq!(s.firmware_vars, None);
        assert_eq!(s.audio_driver, default_audio_driver());
    }

    #[test]
    fn environment_overrides_defaults() {
        let s = resolve(
            &[
                ("SERIALVM_BUNDLE", "/srv/vm.bundle"),
                ("SERIALVM_QEMU", "/opt/qemu/bin/qemu-system-aarch64"),
                ("SERIALVM_FIRMWARE_CODE", "/fw/code.fd"),
                ("SERIALVM_FIRMWARE_VARS", "/fw/vars.fd"),
                ("SERIALVM_AUDIO", "none"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(s.bundle, PathBuf::from("/srv/vm.bundle"));
        assert_eq!(s.qemu, PathBuf::from("/opt/qemu/bin/qemu-system-aarch64"));
        assert_eq!(s.firmware_code, Some(PathBuf::from("/fw/code.fd")));
        assert_eq!(s.firmware_vars, Some(PathBuf::from("/fw/vars.fd")));
        assert_eq!(s.audio_driver, "none");
    }

    #[test]
    fn empty_values_are_ignored() {
        let s = resolve(&[("SERIALVM_BUNDLE", ""), ("SERIALVM_AUDIO", "")], Some("/root")).unwrap();
        assert_eq!(s.bundle, PathBuf::from("/root/SerialVM.bundle"));
        assert_eq!(s.audio_driver, default_audio_driver());
    }

    #[test]
    fn missing_home_needs_explicit_bundle() {
        assert!(resolve(&[], None).is_err());
    }
}
