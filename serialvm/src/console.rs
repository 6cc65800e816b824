//! Terminal takeover for the guest serial console.
//!
//! The launcher's standard input and output become the transport of the
//! guest console. Input is switched to a raw, byte-transparent mode so the
//! guest sees every keystroke as typed: no line buffering, no local echo,
//! no CR-to-NL translation. The previous attributes are not restored on
//! exit.

use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, Termios};
use nix::unistd::dup;
use tracing::{debug, warn};

use crate::Result;

/// Byte stream pair backing the serial console.
#[derive(Debug)]
pub struct SerialAttachment {
    /// Guest console input (host keyboard).
    input: OwnedFd,
    /// Guest console output (host screen).
    output: OwnedFd,
    /// Terminal attributes found on `input` before raw mode was applied.
    previous: Option<Termios>,
}

impl SerialAttachment {
    /// Wraps an already-prepared pair of descriptors.
    pub const fn new(input: OwnedFd, output: OwnedFd) -> Self {
        Self {
            input,
            output,
            previous: None,
        }
    }

    /// Descriptor the guest console reads from.
    pub fn input(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }

    /// Descriptor the guest console writes to.
    pub fn output(&self) -> BorrowedFd<'_> {
        self.output.as_fd()
    }

    /// Terminal attributes of the input before takeover, if it was a terminal.
    pub const fn previous(&self) -> Option<&Termios> {
        self.previous.as_ref()
    }

    /// Consumes the attachment, returning `(input, output)`.
    pub fn into_fds(self) -> (OwnedFd, OwnedFd) {
        (self.input, self.output)
    }
}

/// Clears canonical mode, echo, and CR-to-NL mapping on `attrs`.
///
/// Applying this more than once has no further effect.
pub fn make_raw(attrs: &mut Termios) {
    attrs.input_flags.remove(InputFlags::ICRNL);
    attrs.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
}

/// Takes over the process's standard input and output.
pub fn take_over_stdio() -> Result<SerialAttachment> {
    let input = dup(io::stdin().as_fd()).map_err(io::Error::from)?;
    let output = dup(io::stdout().as_fd()).map_err(io::Error::from)?;
    attach(input, output)
}

/// Switches `input` into raw mode and pairs it with `output`.
///
/// A non-terminal input (pipe, file) is bound as-is.
pub fn attach(input: OwnedFd, output: OwnedFd) -> Result<SerialAttachment> {
    if !input.is_terminal() {
        warn!("console input is not a terminal; leaving it unchanged");
        return Ok(SerialAttachment::new(input, output));
    }

    let previous = termios::tcgetattr(&input).map_err(io::Error::from)?;
    let mut raw = previous.clone();
    make_raw(&mut raw);
    termios::tcsetattr(&input, SetArg::TCSANOW, &raw).map_err(io::Error::from)?;
    debug!("console switched to raw mode");

    Ok(SerialAttachment {
        input,
        output,
        previous: Some(previous),
    })
}

#[cfg(test)]
impl SerialAttachment {
    /// Attachment over a fresh pipe, for tests that must not touch the terminal.
    pub(crate) fn detached() -> io::Result<Self> {
        let (read, write) = nix::unistd::pipe()?;
        Ok(Self::new(read, write))
    }
}
