use clap::Parser;
use run::run_with_sudo;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

mod run;

#[derive(Debug, Parser)]
#[clap(disable_help_subcommand = true)]
pub struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Run fetter with admin privileges
    Fetter(run::Options),
    /// Run the privileged test suite (control groups, kernel audit)
    Test(run::Options),
}

fn main() {
    let opts = Options::parse();

    // Ctrl-C is meant for the child running under sudo: keep running until
    // it exits.
    let _signals = match Signals::new(TERM_SIGNALS) {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("error setting signal handler: {e}");
            std::process::exit(1);
        }
    };

    let ret = match opts.command {
        Command::Fetter(opts) => run_with_sudo("fetter", opts),
        Command::Test(opts) => run_with_sudo("test-suite", opts),
    };

    if let Err(e) = ret {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
