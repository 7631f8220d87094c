//! Shared building blocks of fetter: configuration, the rule model, the
//! capabilities event sources act through and the logging setup.

pub mod capability;
pub mod dispatch;
pub mod logging;
pub mod rule;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_runner;

pub use capability::{MatchContext, ProcessMover, TriggerRunner};
pub use dispatch::Dispatcher;
pub use nix::unistd::Pid;
pub use rule::{Access, KILL, Rule, RuleError};
pub use settings::{AuditMode, ConfigError, Group, RunMode, Settings, Trigger};
