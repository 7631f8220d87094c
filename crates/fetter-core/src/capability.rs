//! Narrow capabilities the event sources act through.
//!
//! The audit source and the scanner never talk to control groups or spawn
//! commands directly: they go through [`ProcessMover`] and [`TriggerRunner`],
//! so they can be exercised against fakes.

use std::{collections::BTreeMap, sync::Arc};

use nix::unistd::Pid;

/// Raw key/value fields harvested from the event that caused a match.
pub type MatchContext = BTreeMap<String, String>;

/// Places processes into control groups (or kills them).
pub trait ProcessMover {
    type Error: std::error::Error;

    /// Move process `pid` into the group named `group`.
    fn move_process(&self, pid: Pid, group: &str) -> Result<(), Self::Error>;
}

/// Fires configured triggers.
pub trait TriggerRunner {
    type Error: std::error::Error;

    /// Launch trigger `name` without waiting for its outcome.
    fn run(&self, name: &str, context: MatchContext) -> Result<(), Self::Error>;
}

impl<T: ProcessMover + ?Sized> ProcessMover for Arc<T> {
    type Error = T::Error;

    fn move_process(&self, pid: Pid, group: &str) -> Result<(), Self::Error> {
        (**self).move_process(pid, group)
    }
}

impl<T: ProcessMover + ?Sized> ProcessMover for &T {
    type Error = T::Error;

    fn move_process(&self, pid: Pid, group: &str) -> Result<(), Self::Error> {
        (**self).move_process(pid, group)
    }
}

impl<T: TriggerRunner + ?Sized> TriggerRunner for Arc<T> {
    type Error = T::Error;

    fn run(&self, name: &str, context: MatchContext) -> Result<(), Self::Error> {
        (**self).run(name, context)
    }
}

impl<T: TriggerRunner + ?Sized> TriggerRunner for &T {
    type Error = T::Error;

    fn run(&self, name: &str, context: MatchContext) -> Result<(), Self::Error> {
        (**self).run(name, context)
    }
}
