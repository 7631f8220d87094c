//! Translation of abstract group budgets into control group resources.

use cgroups_rs::{MaxValue, Resources};
use fetter_core::Group;
use thiserror::Error;

/// CPU scheduling period, in microseconds.
pub const CPU_PERIOD: u64 = 1_000_000;

const MEGABYTE: i64 = 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LimitError {
    #[error("cpu share {0}% out of range (0-100)")]
    Cpu(u64),
    #[error("memory limit of {0} MB out of range")]
    Memory(i64),
    #[error("negative process limit {0}")]
    Pids(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLimit {
    pub quota: i64,
    pub period: u64,
}

/// Limits for a single control group. `None` means no limit, and the
/// corresponding controller file is left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
    pub cpu: Option<CpuLimit>,
    /// Memory ceiling in bytes.
    pub memory: Option<i64>,
    pub pids: Option<i64>,
}

impl Limits {
    /// Build the limits of `group` on a host with `cpus` cores.
    ///
    /// The CPU percentage is a share of the aggregate capacity of all
    /// cores: 50% on a 4 core host allows two full cores.
    pub fn from_group(group: &Group, cpus: usize) -> Result<Self, LimitError> {
        if group.cpu > 100 {
            return Err(LimitError::Cpu(group.cpu));
        }
        if group.ram < 0 {
            return Err(LimitError::Memory(group.ram));
        }
        if group.pids < 0 {
            return Err(LimitError::Pids(group.pids));
        }
        let cpu = if group.cpu > 0 {
            let quota = (group.cpu * CPU_PERIOD)
                .checked_mul(cpus as u64)
                .and_then(|quota| i64::try_from(quota / 100).ok())
                .ok_or(LimitError::Cpu(group.cpu))?;
            Some(CpuLimit {
                quota,
                period: CPU_PERIOD,
            })
        } else {
            None
        };
        let memory = if group.ram > 0 {
            Some(
                group
                    .ram
                    .checked_mul(MEGABYTE)
                    .ok_or(LimitError::Memory(group.ram))?,
            )
        } else {
            None
        };
        let pids = (group.pids > 0).then_some(group.pids);
        Ok(Self { cpu, memory, pids })
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.pids.is_none()
    }
}

impl From<&Limits> for Resources {
    fn from(limits: &Limits) -> Self {
        let mut resources = Resources::default();
        if let Some(CpuLimit { quota, period }) = limits.cpu {
            resources.cpu.quota = Some(quota);
            resources.cpu.period = Some(period);
        }
        if let Some(bytes) = limits.memory {
            resources.memory.memory_hard_limit = Some(bytes);
        }
        if let Some(pids) = limits.pids {
            resources.pid.maximum_number_of_processes = Some(MaxValue::Value(pids));
        }
        resources
    }
}
