#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;

pub const TEST_PASSWORD: &str = "geheim";

/// Builds a `cryptopak` invocation against a `local:` repository at
/// `repo_path`, with the unlock/init password supplied via the same
/// environment variable the CLI itself checks first.
pub fn cli_run(repo_path: &Path) -> Result<Command> {
    let bin_name = env!("CARGO_PKG_NAME");
    let mut cmd = Command::cargo_bin(bin_name)?;
    cmd.env("CRYPTOPAK_PASSWORD", TEST_PASSWORD);
    cmd.arg("--repository").arg(format!("local:{}", repo_path.display()));
    cmd.arg("-vvv");
    Ok(cmd)
}

pub fn init_repo(repo_path: &Path) -> Result<()> {
    cli_run(repo_path)?.arg("init").assert().success();
    Ok(())
}
