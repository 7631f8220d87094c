//! Process enumeration over procfs

use std::{fs, io, path::PathBuf};

use glob::glob;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading link failed {path}")]
    ReadLink {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Pids of every process currently listed in `/proc`.
pub fn running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.trim_start_matches("/proc/").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

/// Canonical path of the executable image of a process.
pub fn process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    let path = format!("/proc/{pid}/exe");
    fs::read_link(&path).map_err(|source| ProcfsError::ReadLink { source, path })
}

#[cfg(test)]
mod tests {
    use nix::unistd::getpid;

    use super::*;

    #[test]
    fn lists_ourselves() {
        let pids = running_processes().unwrap();
        assert!(pids.contains(&getpid()));
    }

    #[test]
    fn own_image() {
        let exe = fs::canonicalize(std::env::current_exe().unwrap()).unwrap();
        assert_eq!(process_image(getpid()).unwrap(), exe);
    }

    #[test]
    fn missing_process() {
        assert!(matches!(
            process_image(Pid::from_raw(i32::MAX)),
            Err(ProcfsError::ReadLink { .. })
        ));
    }
}
