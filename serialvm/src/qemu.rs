//! QEMU backend.
//!
//! Each [`VmConfig`] becomes one `qemu-system-<arch>` child process. The
//! guest console rides on QEMU's `stdio` character device, so the child's
//! standard input and output are the descriptors of the bound
//! [`SerialAttachment`](crate::console::SerialAttachment).

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{BootLoader, VariableStore, VmConfig};
use crate::hypervisor::{Hypervisor, Machine};
use crate::policy::{GIB, Limits, PREFERRED_MEMORY};
use crate::settings::Settings;
use crate::topology::{DiskAttachment, Device, NetworkAttachment};
use crate::{Error, Result};

/// QEMU's `-smp` ceiling for the machine types used here.
const MAX_CPUS: usize = 255;

/// Smallest guest QEMU will run EDK2 firmware in.
const MIN_MEMORY: u64 = 128 << 20;

/// Bytes per `-m` unit.
const MIB: u64 = 1 << 20;

/// How long QEMU must stay up before the start counts as successful.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Lines of QEMU stderr kept for error reports.
const STDERR_TAIL: usize = 20;

/// Accelerators in fallback order.
const ACCELERATORS: [&str; 3] = ["kvm", "hvf", "tcg"];

/// Host audio backend id shared by both codecs.
const AUDIODEV: &str = "hostaudio";

/// Guest CPU architecture, matching the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Arch {
    /// 64-bit ARM, `virt` machine with AAVMF/edk2 firmware.
    Aarch64,
    /// x86-64, `q35` machine with OVMF/edk2 firmware.
    X86_64,
}

impl Arch {
    /// Architecture of the running host, if supported.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "aarch64" => Some(Self::Aarch64),
            "x86_64" => Some(Self::X86_64),
            _ => None,
        }
    }

    /// Architecture name as used in QEMU binary names.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::X86_64 => "x86_64",
        }
    }

    /// QEMU machine type.
    const fn machine(self) -> &'static str {
        match self {
            Self::Aarch64 => "virt",
            Self::X86_64 => "q35",
        }
    }

    /// Well-known `(code, vars template)` install locations.
    const fn firmware_candidates(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Aarch64 => &[
                (
                    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
                    "/opt/homebrew/share/qemu/edk2-arm-vars.fd",
                ),
                (
                    "/usr/local/share/qemu/edk2-aarch64-code.fd",
                    "/usr/local/share/qemu/edk2-arm-vars.fd",
                ),
                (
                    "/usr/share/qemu/edk2-aarch64-code.fd",
                    "/usr/share/qemu/edk2-arm-vars.fd",
                ),
                ("/usr/share/AAVMF/AAVMF_CODE.fd", "/usr/share/AAVMF/AAVMF_VARS.fd"),
                (
                    "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
                    "/usr/share/edk2/aarch64/vars-template-pflash.raw",
                ),
            ],
            Self::X86_64 => &[
                (
                    "/opt/homebrew/share/qemu/edk2-x86_64-code.fd",
                    "/opt/homebrew/share/qemu/edk2-i386-vars.fd",
                ),
                (
                    "/usr/local/share/qemu/edk2-x86_64-code.fd",
                    "/usr/local/share/qemu/edk2-i386-vars.fd",
                ),
                (
                    "/usr/share/qemu/edk2-x86_64-code.fd",
                    "/usr/share/qemu/edk2-i386-vars.fd",
                ),
                ("/usr/share/OVMF/OVMF_CODE_4M.fd", "/usr/share/OVMF/OVMF_VARS_4M.fd"),
                ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
                ("/usr/share/edk2/ovmf/OVMF_CODE.fd", "/usr/share/edk2/ovmf/OVMF_VARS.fd"),
            ],
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hypervisor backed by a `qemu-system-*` child process.
#[derive(Debug, Clone)]
pub struct Qemu {
    /// Emulator binary.
    binary: PathBuf,
    /// Guest architecture.
    arch: Arch,
    /// Explicit firmware code image.
    firmware_code: Option<PathBuf>,
    /// Explicit variable store template.
    firmware_vars: Option<PathBuf>,
    /// `-audiodev` driver.
    audio_driver: String,
    /// Upper memory bound, the host's physical memory.
    max_memory: u64,
}

impl Qemu {
    /// Creates a backend for the host architecture.
    pub fn new(settings: &Settings) -> Result<Self> {
        let arch = Arch::host().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported host architecture {}", std::env::consts::ARCH),
            )
        })?;
        Ok(Self {
            binary: settings.qemu.clone(),
            arch,
            firmware_code: settings.firmware_code.clone(),
            firmware_vars: settings.firmware_vars.clone(),
            audio_driver: settings.audio_driver.clone(),
            max_memory: physical_memory().unwrap_or(PREFERRED_MEMORY),
        })
    }

    /// Guest architecture.
    pub const fn arch(&self) -> Arch {
        self.arch
    }

    /// Resolves the `(code, vars template)` firmware pair.
    ///
    /// Explicit settings win; anything left unset comes from the first
    /// well-known location where both files are installed.
    fn firmware(&self) -> io::Result<(PathBuf, PathBuf)> {
        if let (Some(code), Some(vars)) = (&self.firmware_code, &self.firmware_vars) {
            return Ok((code.clone(), vars.clone()));
        }
        let (code, vars) = first_installed(self.arch.firmware_candidates()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "no {} UEFI firmware found; set SERIALVM_FIRMWARE_CODE and SERIALVM_FIRMWARE_VARS",
                    self.arch
                ),
            )
        })?;
        Ok((
            self.firmware_code.clone().unwrap_or(code),
            self.firmware_vars.clone().unwrap_or(vars),
        ))
    }

    /// Builds the emulator command line for `config`.
    fn command_line(&self, config: &VmConfig, firmware_code: &Path) -> Vec<OsString> {
        let mut args = Args::default();

        args.flag("-nodefaults");
        args.opt("-display", "none");
        args.opt("-name", "serialvm");
        args.opt("-machine", self.arch.machine());
        for accel in ACCELERATORS {
            args.opt("-accel", accel);
        }
        args.opt("-cpu", "max");
        args.opt("-smp", config.cpus.to_string());
        args.opt("-m", format!("{}M", config.memory / MIB));
        args.opt("-uuid", config.platform.identity.to_string());

        match &config.boot_loader {
            BootLoader::Efi(store) => {
                args.opt(
                    "-drive",
                    drive("if=pflash,format=raw,unit=0,readonly=on", firmware_code),
                );
                args.opt("-drive", drive("if=pflash,format=raw,unit=1", store.path()));
            }
        }

        let uses_usb = config.devices.iter().any(|d| {
            matches!(
                d,
                Device::UsbMassStorage(_) | Device::Keyboard | Device::Pointer
            )
        });
        if uses_usb {
            args.opt("-device", "qemu-xhci,id=xhci");
        }
        let uses_audio = config
            .devices
            .iter()
            .any(|d| matches!(d, Device::AudioInput | Device::AudioOutput));
        if uses_audio {
            args.opt("-audiodev", format!("{},id={AUDIODEV}", self.audio_driver));
            args.opt("-device", "intel-hda,id=hda");
        }

        let mut boot_index = 0;
        for (i, device) in config.devices.iter().enumerate() {
            match device {
                Device::UsbMassStorage(disk) => {
                    args.opt("-drive", disk_drive(&format!("usb{i}"), disk));
                    args.opt(
                        "-device",
                        format!("usb-storage,bus=xhci.0,drive=usb{i},bootindex={boot_index}"),
                    );
                    boot_index += 1;
                }
                Device::BlockStorage(disk) => {
                    args.opt("-drive", disk_drive(&format!("blk{i}"), disk));
                    args.opt(
                        "-device",
                        format!("virtio-blk-pci,drive=blk{i},bootindex={boot_index}"),
                    );
                    boot_index += 1;
                }
                Device::Network(NetworkAttachment::Nat) => {
                    args.opt("-netdev", format!("user,id=net{i}"));
                    args.opt("-device", format!("virtio-net-pci,netdev=net{i}"));
                }
                Device::AudioInput => {
                    args.opt("-device", format!("hda-micro,bus=hda.0,audiodev={AUDIODEV}"));
                }
                Device::AudioOutput => {
                    args.opt("-device", format!("hda-output,bus=hda.0,audiodev={AUDIODEV}"));
                }
                Device::Keyboard => args.opt("-device", "usb-kbd,bus=xhci.0"),
                Device::Pointer => args.opt("-device", "usb-tablet,bus=xhci.0"),
                Device::Serial(_) => {
                    args.opt("-chardev", format!("stdio,id=console{i},signal=off"));
                    args.opt("-device", format!("virtio-serial-pci,id=vserial{i}"));
                    args.opt(
                        "-device",
                        format!("virtconsole,bus=vserial{i}.0,chardev=console{i}"),
                    );
                }
            }
        }

        args.0
    }
}

impl Hypervisor for Qemu {
    type Machine = QemuMachine;

    fn limits(&self) -> Limits {
        let max_memory = self.max_memory / MIB * MIB;
        Limits::new(1, MAX_CPUS, MIN_MEMORY, max_memory.max(MIN_MEMORY))
    }

    fn create_variable_store(&self, path: &Path) -> Result<VariableStore> {
        let fail = |e| Error::create("firmware variable store", path, e);
        let (_, template) = self.firmware().map_err(fail)?;
        let mut src = fs::File::open(&template).map_err(fail)?;
        let mut dst = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(fail)?;
        io::copy(&mut src, &mut dst).map_err(fail)?;
        dst.sync_all().map_err(fail)?;
        debug!(template = %template.display(), path = %path.display(), "variable store created");
        Ok(VariableStore::new(path))
    }

    fn open_variable_store(&self, path: &Path) -> Result<VariableStore> {
        if !path.is_file() {
            return Err(Error::integrity(path, "firmware variable store is missing"));
        }
        Ok(VariableStore::new(path))
    }

    fn disk_attachment(&self, path: &Path, read_only: bool) -> Result<DiskAttachment> {
        DiskAttachment::open(path, read_only)
    }

    fn instantiate(&self, mut config: VmConfig) -> Result<QemuMachine> {
        let (code, _) = self.firmware()?;
        let args = self.command_line(&config, &code);

        let serial = config
            .devices
            .iter_mut()
            .find_map(|d| match d {
                Device::Serial(slot) => slot.take(),
                _ => None,
            })
            .ok_or_else(|| Error::Validation("serial console is not bound".into()))?;
        let (input, output) = serial.into_fds();

        debug!(binary = %self.binary.display(), ?args, "qemu command line");
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::from(input))
            .stdout(Stdio::from(output))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(QemuMachine::new(command, STARTUP_GRACE))
    }
}

/// A QEMU child process.
#[derive(Debug)]
pub struct QemuMachine {
    /// Command to spawn, consumed by `start`.
    command: Option<Command>,
    /// Running emulator.
    child: Option<Child>,
    /// Delivers the stderr tail once QEMU closes its stderr.
    diagnostics: Option<oneshot::Receiver<String>>,
    /// How long the child must survive for `start` to succeed.
    grace: Duration,
}

impl QemuMachine {
    /// Wraps a prepared command.
    fn new(command: Command, grace: Duration) -> Self {
        Self {
            command: Some(command),
            child: None,
            diagnostics: None,
            grace,
        }
    }

    /// Waits for the stderr forwarder and returns what it captured.
    async fn diagnostics(&mut self) -> String {
        match self.diagnostics.take() {
            Some(rx) => rx.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl Machine for QemuMachine {
    async fn start(&mut self) -> Result<()> {
        let mut command = self
            .command
            .take()
            .ok_or_else(|| Error::Start("emulator already started".into()))?;
        let program = command.as_std().get_program().to_owned();
        let mut child = command
            .spawn()
            .map_err(|e| Error::Start(format!("{}: {e}", Path::new(&program).display())))?;

        if let Some(stderr) = child.stderr.take() {
            let (tx, rx) = oneshot::channel();
            tokio::spawn(forward_stderr(stderr, tx));
            self.diagnostics = Some(rx);
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                let detail = self.diagnostics().await;
                Err(Error::Start(describe(status, &detail)))
            }
            Err(_) => {
                info!(pid = child.id(), "emulator running");
                self.child = Some(child);
                Ok(())
            }
        }
    }

    async fn wait(&mut self) -> Result<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::Guest("emulator is not running".into()))?;
        let status = child.wait().await?;
        self.child = None;
        let detail = self.diagnostics().await;
        if status.success() {
            info!("emulator exited");
            Ok(())
        } else {
            Err(Error::Guest(describe(status, &detail)))
        }
    }
}

/// Logs each stderr line and sends the last few once the stream closes.
async fn forward_stderr(stderr: ChildStderr, done: oneshot::Sender<String>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "qemu", "{line}");
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    let _ = done.send(Vec::from(tail).join("\n"));
}

/// Formats an exit status with the captured stderr.
fn describe(status: ExitStatus, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("emulator {status}")
    } else {
        format!("emulator {status}: {stderr}")
    }
}

/// First pair whose code and vars files both exist.
fn first_installed(candidates: &[(&str, &str)]) -> Option<(PathBuf, PathBuf)> {
    candidates
        .iter()
        .map(|(code, vars)| (PathBuf::from(code), PathBuf::from(vars)))
        .find(|(code, vars)| code.is_file() && vars.is_file())
}

/// Total physical memory of the host.
#[allow(unsafe_code)]
fn physical_memory() -> Option<u64> {
    // SAFETY: sysconf only reads system configuration values.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    let pages = u64::try_from(pages).ok().filter(|&n| n > 0)?;
    let page_size = u64::try_from(page_size).ok().filter(|&n| n > 0)?;
    let total = pages.saturating_mul(page_size);
    debug!(gib = total / GIB, "host physical memory");
    Some(total)
}

/// `-drive` value for a storage device backed by `disk`.
fn disk_drive(id: &str, disk: &DiskAttachment) -> OsString {
    let mut opts = format!("if=none,id={id},format=raw");
    if disk.read_only() {
        opts.push_str(",readonly=on");
    }
    drive(&opts, disk.path())
}

/// Appends an escaped `file=` option to `opts`.
fn drive(opts: &str, file: &Path) -> OsString {
    let mut value = OsString::from(opts);
    value.push(",file=");
    value.push(escape(file));
    value
}

/// Doubles commas, QEMU's escape inside option values.
fn escape(path: &Path) -> OsString {
    let bytes = path.as_os_str().as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        out.push(b);
        if b == b',' {
            out.push(b',');
        }
    }
    OsString::from_vec(out)
}

/// Command-line accumulator.
#[derive(Debug, Default)]
struct Args(Vec<OsString>);

impl Args {
    /// Adds a bare flag.
    fn flag(&mut self, name: &str) {
        self.0.push(name.into());
    }

    /// Adds an option and its value.
    fn opt(&mut self, name: &str, value: impl Into<OsString>) {
        self.0.push(name.into());
        self.0.push(value.into());
    }
}
