//! Polling fallback: find running processes whose executable matches a rule.
//!
//! Only `execute` rules with a group are considered: triggers react to the
//! moment a file is accessed, which polling cannot observe. Processes that
//! spawn short lived children, or exit and are replaced, within one polling
//! interval may never be seen; the audit source does not have this gap.

use std::{collections::BTreeMap, future::Future, path::PathBuf, time::Duration};

use fetter_core::{Access, ProcessMover, Settings};
use thiserror::Error;

pub mod procfs;

use procfs::ProcfsError;

/// Delay between two passes of the scanner loop.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot enumerate running processes")]
    Enumerate(#[source] ProcfsError),
}

pub struct ProcessScanner<M> {
    /// Executable path to target group.
    targets: BTreeMap<PathBuf, String>,
    mover: M,
}

impl<M: ProcessMover> ProcessScanner<M> {
    pub fn new(settings: &Settings, mover: M) -> Self {
        let mut targets = BTreeMap::new();
        for (name, rule) in &settings.rules {
            let Some(group) = rule.group() else {
                continue;
            };
            if rule.access() != Some(Access::Execute) {
                continue;
            }
            for path in &rule.paths {
                match targets.get(PathBuf::from(path).as_path()) {
                    Some(existing) => log::warn!(
                        "Path {path} of rule {name} already mapped to group {existing}, ignoring"
                    ),
                    None => {
                        targets.insert(PathBuf::from(path), group.to_string());
                    }
                }
            }
        }
        log::debug!("Scanner watching {} executables", targets.len());
        Self { targets, mover }
    }

    /// Number of executables being looked for.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Single pass over the running processes. Returns how many processes
    /// matched a rule.
    pub fn scan(&self) -> Result<usize, ScanError> {
        let pids = procfs::running_processes().map_err(ScanError::Enumerate)?;
        let mut matches = 0;
        for pid in pids {
            // Processes exiting during the pass are expected.
            let Ok(exe) = procfs::process_image(pid) else {
                continue;
            };
            let Some(group) = self.targets.get(&exe) else {
                continue;
            };
            matches += 1;
            log::debug!("Adding {} (pid {pid}) to group {group}", exe.display());
            if let Err(err) = self.mover.move_process(pid, group) {
                log::warn!("Could not move pid {pid} to {group}: {err}");
            }
        }
        Ok(matches)
    }

    /// Scan every [`SCAN_INTERVAL`] until `shutdown` completes.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(err) = self.scan() {
                        log::error!("{err}");
                    }
                }
            }
        }
        log::info!("Process scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, fs, sync::Mutex};

    use fetter_core::{Pid, Rule};
    use nix::unistd::getpid;

    use super::*;

    #[derive(Default)]
    struct FakeMover {
        moved: Mutex<Vec<(Pid, String)>>,
    }

    impl ProcessMover for FakeMover {
        type Error = Infallible;

        fn move_process(&self, pid: Pid, group: &str) -> Result<(), Infallible> {
            self.moved.lock().unwrap().push((pid, group.to_string()));
            Ok(())
        }
    }

    fn rule(path: &str, access: &str, group: Option<&str>, trigger: Option<&str>) -> Rule {
        Rule {
            paths: vec![path.to_string()],
            access: access.to_string(),
            group: group.map(String::from),
            trigger: trigger.map(String::from),
        }
    }

    fn own_executable() -> String {
        let exe = fs::canonicalize(std::env::current_exe().unwrap()).unwrap();
        exe.to_string_lossy().to_string()
    }

    #[test]
    fn only_execute_rules_with_group() {
        let mut settings = Settings::default();
        let rules = [
            ("a", rule("/bin/a", "execute", Some("g1"), None)),
            ("b", rule("/bin/b", "execute", None, Some("t1"))),
            ("c", rule("/bin/c", "read", Some("g1"), None)),
            ("d", rule("/bin/d", "bogus", Some("g1"), None)),
            ("e", rule("/bin/e", "execute", Some(""), Some("t1"))),
        ];
        for (name, rule) in rules {
            settings.rules.insert(name.to_string(), rule);
        }
        let scanner = ProcessScanner::new(&settings, FakeMover::default());
        assert_eq!(scanner.len(), 1);
        assert_eq!(scanner.targets[&PathBuf::from("/bin/a")], "g1");
    }

    #[test]
    fn first_rule_wins_on_duplicate_paths() {
        let mut settings = Settings::default();
        settings
            .rules
            .insert("zzz".to_string(), rule("/bin/x", "execute", Some("late"), None));
        settings
            .rules
            .insert("aaa".to_string(), rule("/bin/x", "execute", Some("early"), None));
        let scanner = ProcessScanner::new(&settings, FakeMover::default());
        assert_eq!(scanner.targets[&PathBuf::from("/bin/x")], "early");
    }

    #[test]
    fn scan_finds_own_process() {
        let exe = own_executable();
        let mut settings = Settings::default();
        settings
            .rules
            .insert("r1".to_string(), rule(&exe, "execute", Some("g1"), None));
        settings
            .rules
            .insert("r2".to_string(), rule(&exe, "execute", Some("g1"), None));
        let scanner = ProcessScanner::new(&settings, FakeMover::default());
        assert!(scanner.scan().unwrap() >= 1);

        let moved = scanner.mover.moved.lock().unwrap();
        let own: Vec<_> = moved.iter().filter(|(pid, _)| *pid == getpid()).collect();
        assert_eq!(own, vec![&(getpid(), "g1".to_string())]);
    }

    #[test]
    fn scan_without_rules() {
        let scanner = ProcessScanner::new(&Settings::default(), FakeMover::default());
        assert!(scanner.is_empty());
        assert_eq!(scanner.scan().unwrap(), 0);
        assert!(scanner.mover.moved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let scanner = ProcessScanner::new(&Settings::default(), FakeMover::default());
        tokio::time::timeout(
            Duration::from_secs(5),
            scanner.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap();
    }
}
