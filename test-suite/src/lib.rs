mod test_suite_runner;

pub use test_suite_runner::TestSuiteRunner;

/// Returns the modules with privileged tests
pub fn modules() -> Vec<fetter_core::test_runner::TestSuite> {
    vec![
        cgroup_manager::test_suite::tests(),
        audit_monitor::test_suite::tests(),
    ]
}
