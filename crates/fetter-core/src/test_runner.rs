//! Test utility for privileged tests
//!
//! Tests touching the real control group hierarchy or the kernel audit
//! subsystem need root. Every module exports its own [`TestSuite`] behind a
//! `test-suite` feature, and the `test-suite` binary runs them all:
//! ```ignore
//! #[cfg(feature = "test-suite")]
//! pub mod test_suite {
//!     use fetter_core::test_runner::{TestCase, TestReport, TestSuite};
//!
//!     pub fn tests() -> TestSuite {
//!         TestSuite {
//!             name: "cgroup-manager",
//!             tests: vec![freeze_on_creation()],
//!         }
//!     }
//!
//!     fn freeze_on_creation() -> TestCase {
//!         TestCase::new("freeze_on_creation", async {
//!             let mut report = TestReport::new();
//!             report.check("group is frozen", is_frozen());
//!             report
//!         })
//!     }
//! }
//! ```

use std::{fmt::Display, future::Future, pin::Pin};

/// Every module should export its own test suite
pub struct TestSuite {
    /// Name of the module
    pub name: &'static str,
    /// List of tests to run
    pub tests: Vec<TestCase>,
}

/// Every feature have a test case
pub struct TestCase {
    /// Name of the test
    pub name: &'static str,
    /// A test is an async function which returns a TestReport
    pub test: Pin<Box<dyn Future<Output = TestReport> + Send>>,
}

impl TestCase {
    pub fn new(
        name: &'static str,
        test: impl Future<Output = TestReport> + 'static + Send,
    ) -> Self {
        Self {
            name,
            test: Box::pin(test),
        }
    }
}

/// TestReport is the TestCase output
#[must_use]
#[derive(Debug)]
pub struct TestReport {
    /// Wheather or not the test passed
    pub success: bool,
    /// Output describing the failure
    pub lines: Vec<String>,
}

impl Default for TestReport {
    fn default() -> Self {
        Self::new()
    }
}

impl TestReport {
    pub fn new() -> Self {
        Self {
            success: true,
            lines: Vec::new(),
        }
    }

    /// Record an expectation; a false one fails the whole report.
    pub fn check(&mut self, description: impl Display, passed: bool) -> &mut Self {
        let mark = if passed { "ok" } else { "FAILED" };
        self.lines.push(format!("| {description}: {mark}"));
        self.success &= passed;
        self
    }

    /// Fail the report with an explanation.
    pub fn fail(mut self, reason: impl Display) -> Self {
        self.lines.push(format!("| {reason}"));
        self.success = false;
        self
    }
}
