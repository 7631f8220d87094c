use nix::unistd::geteuid;
use test_suite::{TestSuiteRunner, modules};

#[tokio::main]
async fn main() {
    if !geteuid().is_root() {
        eprintln!("test-suite must be run as root");
        std::process::exit(1);
    }
    TestSuiteRunner::spawn().run_tests(modules()).await;
}
