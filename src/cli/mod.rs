use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};
use fetter_core::settings::DEFAULT_CONFIG_FILE;

pub const NAME: &str = "fetter";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(version = crate::version())]
#[clap(about = "Move processes into control groups based on configurable actions")]
pub struct FetterOpts {
    /// Path to configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Fork to a daemonized process in background
    #[clap(short, long)]
    pub daemon: bool,
    /// Scan already active processes according to rules
    #[clap(short, long)]
    pub scan: bool,
    /// Delete control groups and exit
    #[clap(short = 'D', long = "clean-up")]
    pub clean_up: bool,
    /// Scan processes according to rules and exit
    #[clap(short = 'S', long = "scan-and-exit")]
    pub scan_and_exit: bool,
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}

/// What the command line asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CleanUp,
    ScanAndExit,
    Run { daemonize: bool, also_scan: bool },
}

impl FetterOpts {
    /// Clean up wins over scan-and-exit, which wins over running.
    pub fn action(&self) -> Action {
        if self.clean_up {
            Action::CleanUp
        } else if self.scan_and_exit {
            Action::ScanAndExit
        } else {
            Action::Run {
                daemonize: self.daemon,
                also_scan: self.scan,
            }
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbosity)
    }
}

pub fn parse_from_args() -> FetterOpts {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> FetterOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    FetterOpts::try_parse_from(args).unwrap_or_else(|e| e.exit())
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        u8::MIN..=0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
