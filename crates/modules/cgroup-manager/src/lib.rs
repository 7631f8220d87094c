//! Control group hierarchy manager.
//!
//! All configured groups are realized once, at startup, as children of a
//! single root node named after the application instance. The hierarchy is
//! read only afterwards and can be shared between tasks without locking.
//!
//! Removing the hierarchy is a separate operation ([`GroupHierarchy::delete`]):
//! every member process is first migrated to the top level control group,
//! since removing a node which still has members fails.

use std::collections::{BTreeMap, BTreeSet};

use cgroups_rs::{
    Cgroup, CgroupPid, Hierarchy, Resources, freezer::FreezerController, hierarchies,
};
use fetter_core::{Group, KILL, Pid, ProcessMover, Settings};
use nix::sys::signal::{Signal, kill};
use thiserror::Error;

pub mod limits;

use limits::{LimitError, Limits};

#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("could not create base cgroup with name {name}")]
    CreateRoot {
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
    #[error("could not create subgroup with empty name")]
    EmptyName,
    #[error("could not create subgroup with name {name}")]
    CreateSubgroup {
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
    #[error("invalid budget for subgroup {name}: {source}")]
    Limits {
        name: String,
        #[source]
        source: LimitError,
    },
    #[error("could not apply limits to subgroup {name}")]
    ApplyLimits {
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
    #[error("freezer controller not available for subgroup {0}")]
    FreezerUnavailable(String),
    #[error("could not freeze subgroup {name}")]
    Freeze {
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
    #[error("could not add process {pid} to subgroup {name}")]
    AddProcess {
        pid: Pid,
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
    #[error("could not kill process {pid}")]
    Kill {
        pid: Pid,
        #[source]
        source: nix::Error,
    },
    #[error("base cgroup with name {0} not found")]
    NotFound(String),
    #[error("could not migrate process {pid} out of {name}")]
    Migrate {
        pid: u64,
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
    #[error("could not delete cgroup {name}")]
    Delete {
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },
}

/// The realized root node and its subgroups, by group name.
pub struct GroupHierarchy {
    name: String,
    subgroups: BTreeMap<String, Cgroup>,
}

impl GroupHierarchy {
    /// Create the root node and one subgroup per configured group.
    ///
    /// Failing to create the root node is fatal. A subgroup which cannot be
    /// created is logged and left out: placements into it will be ignored.
    pub fn new(settings: &Settings) -> Result<Self, CgroupError> {
        Cgroup::new(hierarchies::auto(), &settings.name).map_err(|source| {
            CgroupError::CreateRoot {
                name: settings.name.clone(),
                source,
            }
        })?;

        let mut hierarchy = Self {
            name: settings.name.clone(),
            subgroups: BTreeMap::new(),
        };
        let cpus = num_cpus::get();
        for (name, group) in &settings.groups {
            if let Err(err) = hierarchy.add_subgroup(name, group, cpus) {
                log::error!("{err}");
            }
        }
        Ok(hierarchy)
    }

    fn add_subgroup(&mut self, name: &str, group: &Group, cpus: usize) -> Result<(), CgroupError> {
        if name.is_empty() {
            return Err(CgroupError::EmptyName);
        }
        let limits = Limits::from_group(group, cpus).map_err(|source| CgroupError::Limits {
            name: name.to_string(),
            source,
        })?;
        log::debug!("Cgroup limits created for {name}: {limits:?}");

        let subgroup = Cgroup::new(hierarchies::auto(), self.path_of(name)).map_err(|source| {
            CgroupError::CreateSubgroup {
                name: name.to_string(),
                source,
            }
        })?;
        if !limits.is_empty() {
            if let Err(source) = subgroup.apply(&Resources::from(&limits)) {
                if let Err(err) = subgroup.delete() {
                    log::warn!("Could not remove half created subgroup {name}: {err}");
                }
                return Err(CgroupError::ApplyLimits {
                    name: name.to_string(),
                    source,
                });
            }
        }

        // Frozen before it is published, so no process can run inside
        // it unfrozen. A failed freeze still leaves the group usable.
        let frozen = if group.freeze {
            freeze(name, &subgroup)
        } else {
            Ok(())
        };
        self.subgroups.insert(name.to_string(), subgroup);
        frozen?;

        log::debug!("Added subgroup {name}: {group:?}");
        Ok(())
    }

    fn path_of(&self, group: &str) -> String {
        format!("{}/{}", self.name, group)
    }

    /// Remove the hierarchy created by a previous run with the same settings.
    ///
    /// Best effort: member processes are moved to the top level control
    /// group, failures are logged, and deletion goes on regardless. The first
    /// error encountered is returned. Calling it when no hierarchy exists
    /// reports [`CgroupError::NotFound`].
    pub fn delete(settings: &Settings) -> Result<(), CgroupError> {
        let name = &settings.name;
        let root = Cgroup::load(hierarchies::auto(), name);
        if !root.exists() {
            return Err(CgroupError::NotFound(name.clone()));
        }
        let top = hierarchies::auto().root_control_group();
        let mut first_error = None;
        let mut record = |result: Result<(), CgroupError>| {
            if let Err(err) = result {
                log::error!("{err}");
                first_error.get_or_insert(err);
            }
        };

        for group in subgroup_names(settings) {
            let path = format!("{name}/{group}");
            let subgroup = Cgroup::load(hierarchies::auto(), &path);
            if !subgroup.exists() {
                continue;
            }
            record(evacuate(&path, &subgroup, &top));
            record(remove(&path, &subgroup));
        }
        record(evacuate(name, &root, &top));
        record(remove(name, &root));

        match first_error {
            Some(err) => Err(err),
            None => {
                log::info!("Deleted cgroup hierarchy {name}");
                Ok(())
            }
        }
    }
}

impl ProcessMover for GroupHierarchy {
    type Error = CgroupError;

    fn move_process(&self, pid: Pid, group: &str) -> Result<(), CgroupError> {
        if group == KILL {
            log::info!("Killing process {pid}");
            return kill(pid, Signal::SIGKILL).map_err(|source| CgroupError::Kill { pid, source });
        }
        let Some(subgroup) = self.subgroups.get(group) else {
            log::warn!("Did not find subgroup {group} for pid {pid}");
            return Ok(());
        };
        log::info!("Adding process {pid} to cgroup {group}");
        subgroup
            .add_task_by_tgid(CgroupPid::from(pid.as_raw() as u64))
            .map_err(|source| CgroupError::AddProcess {
                pid,
                name: group.to_string(),
                source,
            })
    }
}

fn freeze(name: &str, subgroup: &Cgroup) -> Result<(), CgroupError> {
    let freezer: &FreezerController = subgroup
        .controller_of()
        .ok_or_else(|| CgroupError::FreezerUnavailable(name.to_string()))?;
    freezer.freeze().map_err(|source| CgroupError::Freeze {
        name: name.to_string(),
        source,
    })?;
    log::debug!("Froze subgroup {name}");
    Ok(())
}

/// Configured groups, plus leftovers of older configurations found on a
/// unified hierarchy.
fn subgroup_names(settings: &Settings) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = settings
        .groups
        .keys()
        .filter(|name| !name.is_empty())
        .cloned()
        .collect();
    let hierarchy = hierarchies::auto();
    if hierarchy.v2() {
        if let Ok(entries) = std::fs::read_dir(hierarchy.root().join(&settings.name)) {
            names.extend(
                entries
                    .flatten()
                    .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                    .map(|entry| entry.file_name().to_string_lossy().into_owned()),
            );
        }
    }
    names
}

/// Move every member of `node` to `top`.
fn evacuate(name: &str, node: &Cgroup, top: &Cgroup) -> Result<(), CgroupError> {
    let mut result = Ok(());
    for pid in node.procs() {
        let raw_pid = pid.pid;
        log::debug!("Moving process {raw_pid} out of {name}");
        if let Err(source) = top.add_task_by_tgid(pid) {
            if result.is_ok() {
                result = Err(CgroupError::Migrate {
                    pid: raw_pid,
                    name: name.to_string(),
                    source,
                });
            }
        }
    }
    result
}

fn remove(name: &str, node: &Cgroup) -> Result<(), CgroupError> {
    node.delete().map_err(|source| CgroupError::Delete {
        name: name.to_string(),
        source,
    })
}


#[cfg(feature = "test-suite")]
pub mod test_suite {
    use std::process::{Child, Command};

    use cgroups_rs::freezer::FreezerState;
    use fetter_core::test_runner::{TestCase, TestReport, TestSuite};
    use rand::{Rng, distributions::Alphanumeric};

    use super::*;

    pub fn tests() -> TestSuite {
        TestSuite {
            name: "cgroup-manager",
            tests: vec![
                create_and_delete(),
                freeze_on_creation(),
                move_then_clean(),
            ],
        }
    }

    fn random_settings() -> Settings {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let mut settings = Settings {
            name: format!("fetter-test-{suffix}"),
            ..Default::default()
        };
        settings.groups.insert(
            "limited".to_string(),
            Group {
                cpu: 50,
                ram: 64,
                pids: 10,
                freeze: false,
            },
        );
        settings.groups.insert(
            "frozen".to_string(),
            Group {
                freeze: true,
                ..Default::default()
            },
        );
        settings
    }

    fn exists(path: &str) -> bool {
        Cgroup::load(hierarchies::auto(), path).exists()
    }

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn create_and_delete() -> TestCase {
        TestCase::new("create_and_delete", async {
            let settings = random_settings();
            let mut report = TestReport::new();
            let hierarchy = match GroupHierarchy::new(&settings) {
                Ok(hierarchy) => hierarchy,
                Err(err) => return report.fail(format!("creation failed: {err}")),
            };
            report.check("root exists", exists(&settings.name));
            for group in settings.groups.keys() {
                report.check(
                    format!("subgroup {group} exists"),
                    exists(&hierarchy.path_of(group)),
                );
            }
            report.check("first delete", GroupHierarchy::delete(&settings).is_ok());
            report.check(
                "second delete reports missing hierarchy",
                matches!(
                    GroupHierarchy::delete(&settings),
                    Err(CgroupError::NotFound(_))
                ),
            );
            for group in settings.groups.keys() {
                report.check(
                    format!("subgroup {group} removed"),
                    !exists(&hierarchy.path_of(group)),
                );
            }
            report.check("root removed", !exists(&settings.name));
            report
        })
    }

    fn freeze_on_creation() -> TestCase {
        TestCase::new("freeze_on_creation", async {
            let settings = random_settings();
            let mut report = TestReport::new();
            let hierarchy = match GroupHierarchy::new(&settings) {
                Ok(hierarchy) => hierarchy,
                Err(err) => return report.fail(format!("creation failed: {err}")),
            };
            let state = hierarchy
                .subgroups
                .get("frozen")
                .and_then(|cg| cg.controller_of::<FreezerController>())
                .and_then(|freezer| freezer.state().ok());
            report.check(
                format!("frozen group state is {state:?}"),
                matches!(state, Some(FreezerState::Frozen | FreezerState::Freezing)),
            );
            let _ = GroupHierarchy::delete(&settings);
            report
        })
    }

    fn move_then_clean() -> TestCase {
        TestCase::new("move_then_clean", async {
            let settings = random_settings();
            let mut report = TestReport::new();
            let hierarchy = match GroupHierarchy::new(&settings) {
                Ok(hierarchy) => hierarchy,
                Err(err) => return report.fail(format!("creation failed: {err}")),
            };
            let mut child = sleeper();
            let pid = Pid::from_raw(child.id() as i32);
            report.check(
                "process added",
                hierarchy.move_process(pid, "limited").is_ok(),
            );
            let members = hierarchy.subgroups["limited"].procs();
            report.check(
                "process is a member",
                members.contains(&CgroupPid::from(pid.as_raw() as u64)),
            );
            report.check(
                "delete with members succeeds",
                GroupHierarchy::delete(&settings).is_ok(),
            );
            report.check("root removed", !exists(&settings.name));
            report.check(
                "process survived cleanup",
                matches!(child.try_wait(), Ok(None)),
            );
            let _ = child.kill();
            let _ = child.wait();
            report
        })
    }
}
