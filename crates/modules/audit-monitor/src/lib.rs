//! Kernel audit event source.
//!
//! Installs one file watch per rule path, tagged with the rule name, then
//! listens to the audit multicast group and dispatches every syscall record
//! carrying one of our tags.

use std::future::Future;

use fetter_core::{
    AuditMode, Dispatcher, MatchContext, Pid, ProcessMover, Settings, TriggerRunner,
};
use thiserror::Error;

pub mod client;
pub mod directive;
pub mod netlink;
pub mod record;

use client::{EventClient, RuleClient};
use directive::{WatchDirective, rule_of};
use netlink::{Message, NetlinkError};
use record::{AUDIT_SYSCALL, AuditRecord};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("could not connect to the audit subsystem")]
    Connect(#[source] NetlinkError),
    #[error("could not read the audit status")]
    Status(#[source] NetlinkError),
    #[error("audit rules are locked, use the reuse audit mode")]
    Locked,
    #[error("could not delete existing audit rules")]
    DeleteRules(#[source] NetlinkError),
    #[error("audit record has an invalid pid: {0:?}")]
    InvalidPid(Option<String>),
}

/// Textual watch directives for every rule, as `(rule, directive)` pairs.
///
/// Invalid rules are logged and skipped.
pub fn directives(settings: &Settings) -> Vec<(String, String)> {
    let mut directives = Vec::new();
    for (name, rule) in &settings.rules {
        let access = match rule.validate() {
            Ok(access) => access,
            Err(err) => {
                log::warn!("Skipping rule {name}: {err}");
                continue;
            }
        };
        for path in &rule.paths {
            let directive = WatchDirective::new(path, access, name);
            directives.push((name.clone(), directive.to_string()));
        }
    }
    directives
}

/// Install watches according to the configured audit mode.
///
/// Returns the number of directives accepted by the kernel. Individual
/// directive failures are logged and do not stop the installation.
pub fn install_rules(client: &RuleClient, settings: &Settings) -> Result<usize, AuditError> {
    if settings.audit.mode == AuditMode::Reuse {
        log::info!("Reusing installed audit rules");
        return Ok(0);
    }
    let status = client.status().map_err(AuditError::Status)?;
    if status.is_locked() {
        return Err(AuditError::Locked);
    }
    if settings.audit.mode == AuditMode::Override {
        let deleted = client.delete_all_rules().map_err(AuditError::DeleteRules)?;
        log::info!("Deleted {deleted} audit rules");
    }
    let mut installed = 0;
    for (rule, text) in directives(settings) {
        let compiled = text
            .parse::<WatchDirective>()
            .and_then(|directive| directive.compile());
        let result = match compiled {
            Ok(data) => client.add_rule(&data).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match result {
            Ok(()) => {
                log::debug!("Added audit rule {text}");
                installed += 1;
            }
            Err(err) => log::warn!("Could not add audit rule '{text}' of {rule}: {err}"),
        }
    }
    Ok(installed)
}

/// Remove the watches installed for `settings` rules, returning how many
/// the kernel dropped. The kernel matches deletions on the full rule
/// payload, so it is rebuilt from the rules.
pub fn remove_rules(client: &RuleClient, settings: &Settings) -> usize {
    directives(settings)
        .into_iter()
        .filter_map(|(_, text)| text.parse::<WatchDirective>().ok()?.compile().ok())
        .filter(|data| client.delete_rule(data).is_ok())
        .count()
}

/// Dispatch a syscall record to its rule.
///
/// Records without our tags are ignored. A record carrying several of our
/// tags is dispatched once, for the first of them.
pub fn handle_record<M, R>(
    record: &AuditRecord,
    dispatcher: &Dispatcher<M, R>,
) -> Result<(), AuditError>
where
    M: ProcessMover,
    R: TriggerRunner,
{
    let Some(rule) = record.tags.iter().find_map(|tag| rule_of(tag)) else {
        return Ok(());
    };
    // 0 and negative values would address process groups when killing.
    let pid = record
        .pid()
        .and_then(|pid| pid.parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| AuditError::InvalidPid(record.pid().map(String::from)))?;
    dispatcher.dispatch(Pid::from_raw(pid), rule, record.fields.clone());
    Ok(())
}

/// Handle one message from the multicast group.
///
/// Only syscall records are considered; a record that cannot be parsed is
/// logged and dropped.
pub fn handle_message<M, R>(
    message: &Message,
    dispatcher: &Dispatcher<M, R>,
) -> Result<(), AuditError>
where
    M: ProcessMover,
    R: TriggerRunner,
{
    if message.header.msg_type != AUDIT_SYSCALL {
        return Ok(());
    }
    match AuditRecord::parse(&message.data) {
        Ok(record) => handle_record(&record, dispatcher),
        Err(err) => {
            log::warn!("Dropping audit record: {err}");
            Ok(())
        }
    }
}

/// Audit event source: owns the multicast listener.
pub struct AuditSource {
    events: EventClient,
}

impl AuditSource {
    /// Configure the kernel and subscribe to audit records.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(settings: &Settings) -> Result<Self, AuditError> {
        let events = EventClient::new().map_err(AuditError::Connect)?;
        let rules = RuleClient::new().map_err(AuditError::Connect)?;
        let result = install_rules(&rules, settings).map(|installed| {
            if installed > 0 {
                log::info!("Installed {installed} audit rules");
            }
            if let Err(err) = rules.set_enabled(true) {
                log::warn!("Could not enable auditing: {err}");
            }
        });
        rules.close();
        result?;
        Ok(Self { events })
    }

    /// Process records until `shutdown` completes or the client is closed.
    ///
    /// Receive errors other than a closed socket are logged and retried.
    pub async fn run<M, R>(
        self,
        dispatcher: &Dispatcher<M, R>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), AuditError>
    where
        M: ProcessMover,
        R: TriggerRunner,
    {
        tokio::pin!(shutdown);
        let result = loop {
            let message = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                message = self.events.receive() => message,
            };
            match message {
                Ok(message) => {
                    if let Err(err) = handle_message(&message, dispatcher) {
                        break Err(err);
                    }
                }
                Err(err) if err.is_closed() => {
                    log::warn!("Audit client has been closed");
                    break Ok(());
                }
                Err(err) => log::warn!("Error listening kernel events: {err}"),
            }
        };
        self.events.close();
        result
    }
}


#[cfg(feature = "test-suite")]
pub mod test_suite {
    use std::{convert::Infallible, sync::Mutex, time::Duration};

    use fetter_core::{
        Rule,
        test_runner::{TestCase, TestReport, TestSuite},
    };

    use super::*;

    pub fn tests() -> TestSuite {
        TestSuite {
            name: "audit-monitor",
            tests: vec![status_is_readable(), install_and_remove(), exec_is_reported()],
        }
    }

    fn settings(path: &str) -> Settings {
        let mut settings = Settings::default();
        settings.audit.mode = AuditMode::Preserve;
        settings.rules.insert(
            "test_suite".to_string(),
            Rule {
                paths: vec![path.to_string()],
                access: "execute".to_string(),
                group: None,
                trigger: Some("observe".to_string()),
            },
        );
        settings
    }

    fn status_is_readable() -> TestCase {
        TestCase::new("status_is_readable", async {
            let client = match RuleClient::new() {
                Ok(client) => client,
                Err(err) => return TestReport::new().fail(format!("connect: {err}")),
            };
            let mut report = TestReport::new();
            report.check("status", client.status().is_ok());
            client.close();
            report
        })
    }

    fn install_and_remove() -> TestCase {
        TestCase::new("install_and_remove", async {
            let settings = settings("/bin/true");
            let client = match RuleClient::new() {
                Ok(client) => client,
                Err(err) => return TestReport::new().fail(format!("connect: {err}")),
            };
            let before = client.rules().map(|r| r.len()).unwrap_or_default();
            let mut report = TestReport::new();
            report.check(
                "one rule installed",
                matches!(install_rules(&client, &settings), Ok(1)),
            );
            let during = client.rules().map(|r| r.len()).unwrap_or_default();
            report.check("rule listed", during == before + 1);
            report.check("one rule removed", remove_rules(&client, &settings) == 1);
            client.close();
            report
        })
    }

    #[derive(Default)]
    struct Observer {
        contexts: Mutex<Vec<MatchContext>>,
    }

    impl ProcessMover for Observer {
        type Error = Infallible;

        fn move_process(&self, _: Pid, _: &str) -> Result<(), Infallible> {
            Ok(())
        }
    }

    impl TriggerRunner for Observer {
        type Error = Infallible;

        fn run(&self, _: &str, context: MatchContext) -> Result<(), Infallible> {
            if let Ok(mut contexts) = self.contexts.lock() {
                contexts.push(context);
            }
            Ok(())
        }
    }

    fn exec_is_reported() -> TestCase {
        TestCase::new("exec_is_reported", async {
            let settings = settings("/bin/true");
            let source = match AuditSource::new(&settings) {
                Ok(source) => source,
                Err(err) => return TestReport::new().fail(format!("audit source: {err}")),
            };
            let observer = Observer::default();
            let dispatcher = Dispatcher::new(&settings, &observer, &observer);
            let shutdown = async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tokio::process::Command::new("/bin/true").status().await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            };
            let result = source.run(&dispatcher, shutdown).await;
            if let Ok(client) = RuleClient::new() {
                remove_rules(&client, &settings);
                client.close();
            }
            let mut report = TestReport::new();
            report.check("loop ended cleanly", result.is_ok());
            let contexts = observer.contexts.lock().map(|c| c.clone()).unwrap_or_default();
            report.check("exec reported", !contexts.is_empty());
            report.check(
                "context carries the pid",
                contexts.iter().all(|c| c.contains_key("pid")),
            );
            report
        })
    }
}
