//! Fetter confines processes into control groups based on the files they
//! access.
//!
//! Rules name executables or files and what to do when they are executed,
//! read or written: move the process into a resource limited control group
//! (or kill it), and/or run a trigger command. Matches come from the kernel
//! audit subsystem, or from polling the running processes.
//!
//! ```sh
//! # Run in background, also placing already running processes
//! fetter --config /etc/fetter/config.yaml --daemon --scan
//!
//! # Remove the control groups
//! fetter --clean-up
//! ```
//!
//! The work is split in crates:
//!
//! - `fetter-core`: configuration, rule model, dispatching and logging.
//! - `cgroup-manager`: control group hierarchy and process placement.
//! - `audit-monitor`: kernel audit rules and event decoding.
//! - `process-scanner`: the polling alternative to audit.
//! - `trigger-runner`: bounded, background execution of trigger commands.

use anyhow::{Context, Result, ensure};
use fetter_core::{Settings, logging::LogHandle};
use nix::unistd::geteuid;

pub mod cli;
pub mod fetterd;

use cli::{Action, FetterOpts};

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

pub fn version() -> &'static str {
    metadata::VERSION
}

/// Load the configuration and perform the requested action.
pub fn run(options: &FetterOpts, logger: &LogHandle) -> Result<()> {
    log::trace!("Fetter options: {:?}", options);

    ensure!(geteuid().is_root(), "this program needs root privileges");

    let settings = Settings::load(&options.config).context("Could not read config")?;

    match options.action() {
        Action::CleanUp => {
            logger.attach_file(&settings.logging)?;
            fetterd::clean(&settings)
        }
        Action::ScanAndExit => {
            logger.attach_file(&settings.logging)?;
            fetterd::scan_once(&settings)
        }
        Action::Run {
            daemonize,
            also_scan,
        } => fetterd::run(settings, logger, daemonize, also_scan),
    }
}
