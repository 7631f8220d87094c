//! Detaching from the controlling terminal.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use nix::{
    fcntl::{FlockArg, flock},
    unistd::{ForkResult, chdir, dup2, fork, getpid, setsid},
};

pub const PID_FILE: &str = "/run/fetter.pid";

pub enum Detached {
    /// We are the parent process: the daemon runs elsewhere.
    Parent,
    /// We are the daemon. The pid file lives as long as this value.
    Daemon(PidFile),
}

/// Fork into the background.
///
/// Must be called before any thread is started.
pub fn daemonize(pid_file: &Path) -> Result<Detached> {
    // SAFETY: no other thread exists yet.
    match unsafe { fork() }.context("Unable to daemonize")? {
        ForkResult::Parent { child } => {
            log::info!("Detaching (daemon pid {child})");
            return Ok(Detached::Parent);
        }
        ForkResult::Child => {}
    }
    setsid().context("Failed to start a new session")?;
    chdir("/").context("Failed to change directory")?;
    let pid_file = PidFile::create(pid_file)?;
    redirect_stdio().context("Failed to redirect standard streams")?;
    Ok(Detached::Daemon(pid_file))
}

fn redirect_stdio() -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}

/// Locked file holding the daemon pid, removed on drop.
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open pid file {}", path.display()))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .with_context(|| format!("Another instance holds {}", path.display()))?;
        file.set_len(0)?;
        writeln!(file, "{}", getpid())?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove {}: {err}", self.path.display());
        }
    }
}
