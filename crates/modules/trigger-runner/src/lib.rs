//! Execution of configured trigger commands.
//!
//! Triggers run in the background, never blocking the event source that
//! fired them. At most `max_running_triggers` commands run at once; further
//! requests wait for a free slot. Up to [`QUEUE_FACTOR`] times that many
//! runs may be pending at any time, running ones included; runs beyond it
//! are refused with [`TriggerError::QueueFull`].

use std::{
    collections::BTreeMap,
    io,
    os::unix::process::CommandExt,
    process::{Command, Output, Stdio},
    sync::Arc,
};

use fetter_core::{MatchContext, Settings, Trigger};
use nix::unistd::{User, geteuid};
use thiserror::Error;
use tokio::sync::Semaphore;

/// User triggers run as when none is configured.
pub const DEFAULT_USER: &str = "nobody";

/// Pending runs allowed per running slot.
pub const QUEUE_FACTOR: usize = 4;

/// Bytes of command output kept for the log.
pub const OUTPUT_LIMIT: usize = 128;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("trigger {0} not found")]
    NotFound(String),
    #[error("user {0} not found")]
    UnknownUser(String),
    #[error("could not look up user {user}")]
    UserLookup {
        user: String,
        #[source]
        source: nix::Error,
    },
    #[error("too many pending runs, dropping trigger {0}")]
    QueueFull(String),
    #[error("no async runtime to run trigger {0}")]
    NoRuntime(String),
    #[error("could not execute {command}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {status}: {output}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        output: String,
    },
    #[error("trigger task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs triggers by name.
#[derive(Debug, Clone)]
pub struct TriggerExecutor {
    triggers: Arc<BTreeMap<String, Trigger>>,
    slots: Arc<Semaphore>,
    pending: Arc<Semaphore>,
}

impl TriggerExecutor {
    pub fn new(settings: &Settings) -> Self {
        let running = settings.max_running_triggers.max(1);
        Self {
            triggers: Arc::new(settings.triggers.clone()),
            slots: Arc::new(Semaphore::new(running)),
            pending: Arc::new(Semaphore::new(running.saturating_mul(QUEUE_FACTOR))),
        }
    }

    /// Run trigger `name` to completion, returning the head of its output.
    pub async fn execute(&self, name: &str, context: MatchContext) -> Result<String, TriggerError> {
        let trigger = self
            .triggers
            .get(name)
            .ok_or_else(|| TriggerError::NotFound(name.to_string()))?;
        let _slot = self.slots.acquire().await;
        execute(trigger, context).await
    }

    /// Number of triggers that could start right now.
    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl fetter_core::TriggerRunner for TriggerExecutor {
    type Error = TriggerError;

    fn run(&self, name: &str, context: MatchContext) -> Result<(), TriggerError> {
        if !self.triggers.contains_key(name) {
            return Err(TriggerError::NotFound(name.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TriggerError::NoRuntime(name.to_string()))?;
        let pending = self
            .pending
            .clone()
            .try_acquire_owned()
            .map_err(|_| TriggerError::QueueFull(name.to_string()))?;
        let executor = self.clone();
        let name = name.to_string();
        runtime.spawn(async move {
            let _pending = pending;
            match executor.execute(&name, context).await {
                Ok(output) => log::info!("Trigger {name} finished: {output}"),
                Err(err) => log::error!("Trigger {name} failed: {err}"),
            }
        });
        Ok(())
    }
}

/// Run `trigger` and wait for it.
pub async fn execute(trigger: &Trigger, context: MatchContext) -> Result<String, TriggerError> {
    let mut command = command(trigger, &context)?;
    let program = trigger.run.clone();
    log::debug!("Running {program} {:?}", trigger.args);
    let output = tokio::task::spawn_blocking(move || command.output())
        .await?
        .map_err(|source| TriggerError::Spawn {
            command: program.clone(),
            source,
        })?;
    let Output {
        status,
        stdout,
        stderr,
    } = output;
    let output = truncate([stdout, stderr].concat());
    if status.success() {
        Ok(output)
    } else {
        Err(TriggerError::Failed {
            command: program,
            status,
            output,
        })
    }
}

/// Build the command of `trigger`.
///
/// The child inherits our environment, with `HOME` pointing to the home of
/// the trigger user and the match context added on top. Switching user only
/// happens when running as root.
fn command(trigger: &Trigger, context: &MatchContext) -> Result<Command, TriggerError> {
    let name = trigger.user.as_deref().unwrap_or(DEFAULT_USER);
    let user = User::from_name(name)
        .map_err(|source| TriggerError::UserLookup {
            user: name.to_string(),
            source,
        })?
        .ok_or_else(|| TriggerError::UnknownUser(name.to_string()))?;

    let mut command = Command::new(&trigger.run);
    command
        .args(&trigger.args)
        .env("HOME", &user.dir)
        .envs(context)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if geteuid().is_root() {
        command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
    }
    Ok(command)
}

/// Keep the first [`OUTPUT_LIMIT`] bytes, cut on a character boundary.
fn truncate(output: Vec<u8>) -> String {
    let text = String::from_utf8_lossy(&output);
    let mut end = text.len().min(OUTPUT_LIMIT);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fetter_core::TriggerRunner;

    use super::*;

    fn current_user() -> String {
        User::from_uid(geteuid()).unwrap().unwrap().name
    }

    fn trigger(run: &str, args: &[&str]) -> Trigger {
        Trigger {
            run: run.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            user: Some(current_user()),
        }
    }

    fn executor(triggers: &[(&str, Trigger)], max_running: usize) -> TriggerExecutor {
        let mut settings = Settings {
            max_running_triggers: max_running,
            ..Default::default()
        };
        for (name, trigger) in triggers {
            settings.triggers.insert(name.to_string(), trigger.clone());
        }
        TriggerExecutor::new(&settings)
    }

    #[tokio::test]
    async fn missing_trigger() {
        let executor = executor(&[], 4);
        assert!(matches!(
            executor.run("nope", MatchContext::new()),
            Err(TriggerError::NotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            executor.execute("nope", MatchContext::new()).await,
            Err(TriggerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_returns_immediately() {
        let sleep = which::which("sleep").unwrap();
        let executor = executor(&[("slow", trigger(sleep.to_str().unwrap(), &["1"]))], 4);
        let start = std::time::Instant::now();
        executor.run("slow", MatchContext::new()).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn successful_command() {
        let t = which::which("true").unwrap();
        let output = execute(&trigger(t.to_str().unwrap(), &[]), MatchContext::new()).await;
        assert_eq!(output.unwrap(), "");
    }

    #[tokio::test]
    async fn failing_command() {
        let ls = which::which("ls").unwrap();
        let result = execute(
            &trigger(ls.to_str().unwrap(), &["/not/a/file"]),
            MatchContext::new(),
        )
        .await;
        match result {
            Err(TriggerError::Failed { status, output, .. }) => {
                assert!(!status.success());
                assert!(!output.is_empty());
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program() {
        let result = execute(&trigger("/not/a/program", &[]), MatchContext::new()).await;
        assert!(matches!(result, Err(TriggerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn unknown_user() {
        let mut t = trigger("true", &[]);
        t.user = Some("fetter-no-such-user".to_string());
        assert!(matches!(
            execute(&t, MatchContext::new()).await,
            Err(TriggerError::UnknownUser(user)) if user == "fetter-no-such-user"
        ));
    }

    #[tokio::test]
    async fn context_reaches_environment() {
        let sh = which::which("sh").unwrap();
        let t = trigger(sh.to_str().unwrap(), &["-c", "printf %s:%s \"$exe\" \"$HOME\""]);
        let context = MatchContext::from([("exe".to_string(), "/usr/bin/make".to_string())]);
        let home = User::from_uid(geteuid()).unwrap().unwrap().dir;
        let output = execute(&t, context).await.unwrap();
        assert_eq!(output, format!("/usr/bin/make:{}", home.display()));
    }

    #[tokio::test]
    async fn output_is_truncated() {
        let sh = which::which("sh").unwrap();
        let t = trigger(
            sh.to_str().unwrap(),
            &["-c", "i=0; while [ $i -lt 300 ]; do printf a; i=$((i+1)); done"],
        );
        let output = execute(&t, MatchContext::new()).await.unwrap();
        assert_eq!(output, "a".repeat(OUTPUT_LIMIT));
    }

    #[test]
    fn truncate_on_char_boundary() {
        let mut text = "a".repeat(OUTPUT_LIMIT - 1).into_bytes();
        text.extend("é".as_bytes());
        assert_eq!(truncate(text), "a".repeat(OUTPUT_LIMIT - 1));
        assert_eq!(truncate(b"short".to_vec()), "short");
    }

    #[tokio::test]
    async fn pending_runs_are_capped() {
        let sleep = which::which("sleep").unwrap();
        let executor = executor(&[("slow", trigger(sleep.to_str().unwrap(), &["1"]))], 1);
        for _ in 0..QUEUE_FACTOR {
            executor.run("slow", MatchContext::new()).unwrap();
        }
        assert!(matches!(
            executor.run("slow", MatchContext::new()),
            Err(TriggerError::QueueFull(name)) if name == "slow"
        ));
    }

    #[tokio::test]
    async fn excess_runs_queue() {
        let sh = which::which("sh").unwrap();
        let file = std::env::temp_dir().join(format!("fetter-trigger-{}", std::process::id()));
        let _ = std::fs::remove_file(&file);
        let t = trigger(sh.to_str().unwrap(), &["-c", "sleep 0.2; echo x >> \"$OUT\""]);
        let executor = executor(&[("append", t)], 1);
        let context =
            MatchContext::from([("OUT".to_string(), file.to_string_lossy().to_string())]);
        for _ in 0..3 {
            executor.run("append", context.clone()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.free_slots(), 0);

        let mut lines = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            lines = std::fs::read_to_string(&file)
                .map(|body| body.lines().count())
                .unwrap_or(0);
            if lines == 3 {
                break;
            }
        }
        let _ = std::fs::remove_file(&file);
        assert_eq!(lines, 3);
    }
}
