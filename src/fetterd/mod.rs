//! Entry points of the fetter daemon.

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use audit_monitor::AuditSource;
use cgroup_manager::{CgroupError, GroupHierarchy};
use fetter_core::{Dispatcher, RunMode, Settings, logging::LogHandle};
use process_scanner::ProcessScanner;
use tokio::signal::unix::{SignalKind, signal};
use trigger_runner::TriggerExecutor;

mod daemon;

pub use daemon::{Detached, PID_FILE, PidFile, daemonize};

/// Delay before scanning running processes in audit mode, so that processes
/// spawned while audit rules were installed are not missed.
const STARTUP_SCAN_DELAY: Duration = Duration::from_secs(1);

/// How long running triggers may delay the exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run until a termination signal, or until the audit client is closed.
///
/// With `daemonize` the calling process returns right away while a detached
/// child does the work.
pub fn run(settings: Settings, logger: &LogHandle, daemonize: bool, also_scan: bool) -> Result<()> {
    let _pid_file = if daemonize {
        match daemon::daemonize(Path::new(PID_FILE))? {
            Detached::Parent => return Ok(()),
            Detached::Daemon(pid_file) => Some(pid_file),
        }
    } else {
        None
    };
    logger.attach_file(&settings.logging)?;

    // Built after forking: the runtime starts threads.
    block_on(serve(settings, also_scan))?
}

/// Drive `future` on a fresh multi-thread runtime.
///
/// Running triggers are not waited for longer than [`SHUTDOWN_TIMEOUT`]
/// once `future` completes.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    Ok(output)
}

async fn serve(settings: Settings, also_scan: bool) -> Result<()> {
    log::info!("Initializing control groups...");
    let groups =
        Arc::new(GroupHierarchy::new(&settings).context("Failed to create control groups")?);
    let shutdown = shutdown_signal()?;

    match settings.mode {
        RunMode::Scanner => {
            log::info!("Scanning active processes...");
            ProcessScanner::new(&settings, groups).run(shutdown).await;
        }
        RunMode::Audit => {
            log::info!("Auditing system calls according to rules...");
            let source = AuditSource::new(&settings)
                .context("Could not setup a kernel syscall listener")?;
            if also_scan {
                let scanner = ProcessScanner::new(&settings, groups.clone());
                tokio::spawn(async move {
                    tokio::time::sleep(STARTUP_SCAN_DELAY).await;
                    log::info!("Scanning already active processes...");
                    if let Err(err) = scanner.scan() {
                        log::error!("{err}");
                    }
                });
            }
            let dispatcher = Dispatcher::new(&settings, groups, TriggerExecutor::new(&settings));
            source.run(&dispatcher, shutdown).await?;
        }
    }
    log::info!("Terminating fetter...");
    Ok(())
}

/// Build the control groups, place matching running processes, and return.
pub fn scan_once(settings: &Settings) -> Result<()> {
    log::info!("Initializing control groups...");
    let groups = GroupHierarchy::new(settings).context("Failed to create control groups")?;
    log::info!("Scanning active processes...");
    let matches = ProcessScanner::new(settings, &groups).scan()?;
    log::info!("Placed {matches} processes");
    Ok(())
}

/// Remove the control groups of `settings`.
///
/// Nothing to remove is not an error.
pub fn clean(settings: &Settings) -> Result<()> {
    match GroupHierarchy::delete(settings) {
        Ok(()) => {
            log::info!("Deleted control group {}", settings.name);
            Ok(())
        }
        Err(CgroupError::NotFound(name)) => {
            log::info!("Control group {name} not found, nothing to clean");
            Ok(())
        }
        Err(err) => Err(err).context("Failed to delete control groups"),
    }
}

/// Resolves on SIGINT or SIGTERM.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sig_int.recv() => log::trace!("SIGINT received"),
            _ = sig_term.recv() => log::trace!("SIGTERM received"),
        }
    })
}
