use std::collections::BTreeMap;

use nix::unistd::Pid;

use crate::{
    capability::{MatchContext, ProcessMover, TriggerRunner},
    settings::Settings,
};

#[derive(Debug, Clone, Default)]
struct RuleActions {
    group: Option<String>,
    trigger: Option<String>,
}

/// Maps a matched rule to its configured actions.
///
/// A rule with both a group and a trigger fires both: the process is
/// confined and the trigger is launched for the same match.
pub struct Dispatcher<M, R> {
    rules: BTreeMap<String, RuleActions>,
    mover: M,
    runner: R,
}

impl<M: ProcessMover, R: TriggerRunner> Dispatcher<M, R> {
    pub fn new(settings: &Settings, mover: M, runner: R) -> Self {
        let rules = settings
            .rules
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    RuleActions {
                        group: settings.group_of(name).map(String::from),
                        trigger: settings.trigger_of(name).map(String::from),
                    },
                )
            })
            .collect();
        Self {
            rules,
            mover,
            runner,
        }
    }

    /// Handle a match of `rule` by process `pid`.
    ///
    /// Failures are logged and never propagated: a single process or
    /// trigger must not stop the event source.
    pub fn dispatch(&self, pid: Pid, rule: &str, context: MatchContext) {
        log::info!("Match for rule {rule} in pid {pid}");
        let Some(actions) = self.rules.get(rule) else {
            log::warn!("Match for unknown rule {rule} (pid {pid}) ignored");
            return;
        };
        if let Some(group) = &actions.group {
            if let Err(err) = self.mover.move_process(pid, group) {
                log::warn!("Could not move pid {pid} to {group}: {err}");
            }
        }
        if let Some(trigger) = &actions.trigger {
            if let Err(err) = self.runner.run(trigger, context) {
                log::error!("Could not run trigger {trigger} for rule {rule}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, convert::Infallible};

    use super::*;
    use crate::rule::Rule;

    #[derive(Default)]
    struct Recorder {
        moved: RefCell<Vec<(Pid, String)>>,
        ran: RefCell<Vec<(String, MatchContext)>>,
    }

    impl ProcessMover for Recorder {
        type Error = Infallible;

        fn move_process(&self, pid: Pid, group: &str) -> Result<(), Infallible> {
            self.moved.borrow_mut().push((pid, group.to_string()));
            Ok(())
        }
    }

    impl TriggerRunner for Recorder {
        type Error = Infallible;

        fn run(&self, name: &str, context: MatchContext) -> Result<(), Infallible> {
            self.ran.borrow_mut().push((name.to_string(), context));
            Ok(())
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        for (name, group, trigger) in [
            ("r1", None, Some("t1")),
            ("r2", Some("g1"), None),
            ("r3", Some("g1"), Some("t1")),
        ] {
            settings.rules.insert(
                name.to_string(),
                Rule {
                    paths: vec!["none".to_string()],
                    access: "execute".to_string(),
                    group: group.map(String::from),
                    trigger: trigger.map(String::from),
                },
            );
        }
        settings
    }

    #[test]
    fn unknown_rule_does_nothing() {
        let recorder = Recorder::default();
        let dispatcher = Dispatcher::new(&settings(), &recorder, &recorder);
        dispatcher.dispatch(Pid::from_raw(1), "fake-rule", MatchContext::new());
        assert!(recorder.moved.borrow().is_empty());
        assert!(recorder.ran.borrow().is_empty());
    }

    #[test]
    fn trigger_only() {
        let recorder = Recorder::default();
        let dispatcher = Dispatcher::new(&settings(), &recorder, &recorder);
        let context = MatchContext::from([("exe".to_string(), "/bin/sh".to_string())]);
        dispatcher.dispatch(Pid::from_raw(1), "r1", context.clone());
        assert!(recorder.moved.borrow().is_empty());
        assert_eq!(*recorder.ran.borrow(), vec![("t1".to_string(), context)]);
    }

    #[test]
    fn move_only() {
        let recorder = Recorder::default();
        let dispatcher = Dispatcher::new(&settings(), &recorder, &recorder);
        dispatcher.dispatch(Pid::from_raw(7), "r2", MatchContext::new());
        assert_eq!(
            *recorder.moved.borrow(),
            vec![(Pid::from_raw(7), "g1".to_string())]
        );
        assert!(recorder.ran.borrow().is_empty());
    }

    #[test]
    fn both_fire() {
        let recorder = Recorder::default();
        let dispatcher = Dispatcher::new(&settings(), &recorder, &recorder);
        dispatcher.dispatch(Pid::from_raw(9), "r3", MatchContext::new());
        assert_eq!(recorder.moved.borrow().len(), 1);
        assert_eq!(recorder.ran.borrow().len(), 1);
    }
}
