use std::panic::AssertUnwindSafe;

use fetter_core::test_runner::{TestCase, TestReport, TestSuite};
use futures::FutureExt;
use libtest_mimic::{Arguments, Failed, Trial};
use tokio::sync::{mpsc, oneshot};

/// Runs the async test cases of every module on the tokio runtime, on behalf
/// of the blocking libtest-mimic harness.
pub struct TestSuiteRunner {
    tx_test: mpsc::Sender<TestRequest>,
}

struct TestRequest {
    test_case: TestCase,
    tx_reply: oneshot::Sender<Result<(), Failed>>,
}

impl TestSuiteRunner {
    pub fn spawn() -> Self {
        // Logs and panics would garble the harness output: they are collected
        // and shown only for failed tests.
        let (tx_log, mut rx_log) = mpsc::unbounded_channel();
        capture_logs(tx_log.clone());
        capture_panics(tx_log);

        let (tx_test, mut rx_test) = mpsc::channel::<TestRequest>(1);
        tokio::spawn(async move {
            while let Some(TestRequest {
                test_case,
                tx_reply,
            }) = rx_test.recv().await
            {
                let TestReport { success, mut lines } = AssertUnwindSafe(test_case.test)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| TestReport::new().fail("test panicked"));
                // Leftovers of the previous test are attributed to this one.
                while let Ok(log) = rx_log.try_recv() {
                    lines.push(log);
                }
                let outcome = if success {
                    Ok(())
                } else {
                    Err(lines.join("\n").into())
                };
                // The harness gave up on this test: nothing to report to.
                let _ = tx_reply.send(outcome);
            }
        });

        Self { tx_test }
    }

    pub async fn run_tests(&self, modules: Vec<TestSuite>) {
        let trials: Vec<Trial> = modules
            .into_iter()
            .flat_map(|suite| {
                let module = suite.name;
                suite
                    .tests
                    .into_iter()
                    .map(move |test_case| self.trial(module, test_case))
            })
            .collect();

        let args = Arguments::from_args();
        let conclusion = tokio::task::spawn_blocking(move || libtest_mimic::run(&args, trials))
            .await
            .unwrap_or_else(|err| panic!("test harness crashed: {err}"));
        conclusion.exit();
    }

    fn trial(&self, module: &str, test_case: TestCase) -> Trial {
        let name = format!("{module}::{}", test_case.name);
        let (tx_reply, rx_reply) = oneshot::channel();
        let request = TestRequest {
            test_case,
            tx_reply,
        };
        let tx_test = self.tx_test.clone();
        Trial::test(name, move || {
            tx_test
                .blocking_send(request)
                .map_err(|_| "test runner is gone")?;
            rx_reply
                .blocking_recv()
                .map_err(|_| "test runner dropped the test")?
        })
    }
}

/// Forward every log line over a channel.
fn capture_logs(tx_log: mpsc::UnboundedSender<String>) {
    struct ChannelLogger(mpsc::UnboundedSender<String>);

    impl log::Log for ChannelLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            let _ = self.0.send(format!(
                "{}:{} -- {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }

        fn flush(&self) {}
    }

    let level = if std::env::var_os("FETTER_TEST_DEBUG").is_some() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if log::set_boxed_logger(Box::new(ChannelLogger(tx_log))).is_ok() {
        log::set_max_level(level);
    }
}

/// Report panics through the log channel, unless USE_NORMAL_PANIC_HANDLER is set.
fn capture_panics(tx_log: mpsc::UnboundedSender<String>) {
    if std::env::var_os("USE_NORMAL_PANIC_HANDLER").is_some() {
        return;
    }
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| {
                "unknown panic, re-run with USE_NORMAL_PANIC_HANDLER set".to_string()
            });
        let location = info
            .location()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown location".to_string());
        let _ = tx_log.send(format!("Panic: {message}\n  | at {location}"));
    }));
}
