#![allow(clippy::cargo_common_metadata)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Fmt,
    Check,
    Clippy,
    /// Start a local signaling relay on the default address
    Run,
    Test,
    Doc,
    PreCommit,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(project_root::get_project_root()?);

    match cli.command {
        Command::Fmt => fmt(&sh)?,
        Command::Check => check(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Run => run(&sh)?,
        Command::Test => test(&sh)?,
        Command::Doc => doc(&sh)?,
        Command::PreCommit => pre_commit(&sh)?,
    };

    Ok(())
}

fn fmt(sh: &Shell) -> Result<()> {
    Ok(cmd!(sh, "cargo fmt --all").run()?)
}

fn check(sh: &Shell) -> Result<()> {
    Ok(cmd!(sh, "cargo check --all-targets --all-features --workspace").run()?)
}

fn clippy(sh: &Shell) -> Result<()> {
    Ok(cmd!(sh, "cargo clippy --all-targets --all-features --workspace").run()?)
}

fn run(sh: &Shell) -> Result<()> {
    Ok(cmd!(sh, "cargo run --package peercall-signaling-server").run()?)
}

// the relay integration tests start their own server on a random port
fn test(sh: &Shell) -> Result<()> {
    Ok(cmd!(sh, "cargo test --workspace --all-features").run()?)
}

fn doc(sh: &Shell) -> Result<()> {
    Ok(cmd!(sh, "cargo doc --no-deps --all-features --workspace").run()?)
}

fn pre_commit(sh: &Shell) -> Result<()> {
    for cmd in [fmt, check, clippy, test, doc] {
        cmd(sh)?;
    }
    Ok(())
}
