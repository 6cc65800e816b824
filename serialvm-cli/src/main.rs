//! CLI for serialvm.
//!
//! `serialvm <IMAGE>` installs a guest from `IMAGE` on first run, or
//! resumes the installed guest afterwards, and hands the terminal to the
//! guest's serial console until the guest shuts down.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use serialvm::{Bundle, Launcher, Qemu, Settings, console};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(
    name = "serialvm",
    version,
    about = "Install or resume an EFI virtual machine on the serial console"
)]
struct Cli {
    /// Installer disk image; only attached when the bundle does not exist yet.
    image: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match usage_error(&e) {
            Some(err) => fail(&err.into()),
            None => {
                let _ = e.print();
                return;
            }
        },
    };

    init_logging();
    if let Err(e) = run(cli).await {
        fail(&e);
    }
}

/// Converts a parse failure into a usage error; `None` for `--help` and
/// `--version`.
fn usage_error(e: &clap::Error) -> Option<serialvm::Error> {
    match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => None,
        _ => Some(serialvm::Error::Usage(format!(
            "expected exactly one installer image path\n\n{}",
            Cli::command().render_usage()
        ))),
    }
}

/// `EX_USAGE` from `sysexits.h`.
const EX_USAGE: i32 = 64;

fn fail(e: &anyhow::Error) -> ! {
    eprintln!("serialvm: {e:#}");
    std::process::exit(exit_code(e));
}

/// `EX_USAGE` for usage errors, 1 for everything else.
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<serialvm::Error>() {
        Some(serialvm::Error::Usage(_)) => EX_USAGE,
        _ => 1,
    }
}

/// Logs go to stderr, `warn` and above unless `RUST_LOG` says otherwise.
fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env().context("failed to resolve settings")?;
    let qemu = Qemu::new(&settings)?;
    let mut launcher = Launcher::new(qemu, Bundle::new(&settings.bundle), cli.image);

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    launcher.boot(console::take_over_stdio).await?;

    let outcome = tokio::select! {
        result = launcher.wait() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
        _ = terminate.recv() => None,
    };
    match outcome {
        Some(result) => result?,
        None => {
            info!("termination requested");
            launcher.terminate();
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn usage_exit(args: &[&str]) -> Option<i32> {
        let err = Cli::try_parse_from(args).unwrap_err();
        usage_error(&err).map(|e| exit_code(&e.into()))
    }

    #[test]
    fn single_image_is_accepted() {
        let cli = Cli::try_parse_from(["serialvm", "install.iso"]).unwrap();
        assert_eq!(cli.image, PathBuf::from("install.iso"));
    }

    #[test]
    fn missing_image_is_a_usage_error() {
        assert_eq!(usage_exit(&["serialvm"]), Some(EX_USAGE));
    }

    #[test]
    fn extra_arguments_are_a_usage_error() {
        assert_eq!(usage_exit(&["serialvm", "a.iso", "b.iso"]), Some(EX_USAGE));
    }

    #[test]
    fn help_and_version_are_not_errors() {
        assert_eq!(usage_exit(&["serialvm", "--help"]), None);
        assert_eq!(usage_exit(&["serialvm", "--version"]), None);
    }

    #[test]
    fn usage_message_shows_the_synopsis() {
        let err = Cli::try_parse_from(["serialvm"]).unwrap_err();
        let msg = usage_error(&err).unwrap().to_string();
        assert!(msg.contains("Usage: serialvm <IMAGE>"), "{msg}");
    }

    #[test]
    fn other_failures_exit_with_one() {
        let err: anyhow::Error = serialvm::Error::Start("boom".into()).into();
        assert_eq!(exit_code(&err), 1);
    }
}
