use anyhow::Result;
use clap::Parser;
use xshell::{Shell, cmd};

#[derive(Debug, Parser)]
pub struct Options {
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// Arguments to pass to the binary
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

/// Build `binary` as the current user, then run it as root.
pub fn run_with_sudo(binary: &str, opts: Options) -> Result<()> {
    let sh = Shell::new()?;

    let release = opts.release.then_some("--release");
    cmd!(sh, "cargo build --bin {binary} {release...}").run()?;

    let profile = if opts.release { "release" } else { "debug" };
    let args = opts.run_args;
    // -E keeps RUST_LOG and friends
    cmd!(sh, "sudo -E ./target/{profile}/{binary} {args...}").run()?;

    Ok(())
}
