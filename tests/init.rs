use anyhow::Result;
use predicates::prelude::*;
use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn init_then_reopen_with_right_password_succeeds() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");

    cli_run(&repo_path)?.arg("init").assert().success();

    // Reopening (any command that unlocks) with the same password works.
    cli_run(&repo_path)?.arg("snapshots").assert().success();

    Ok(())
}

#[test]
fn reopen_with_wrong_password_fails() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");
    cli_run(&repo_path)?.arg("init").assert().success();

    let mut cmd = cli_run(&repo_path)?;
    cmd.env("CRYPTOPAK_PASSWORD", "wrong");
    cmd.arg("snapshots")
        .assert()
        .failure()
        .stderr(predicate::str::contains("password").or(predicate::str::contains("unlock")));

    Ok(())
}

#[test]
fn init_twice_fails() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");
    cli_run(&repo_path)?.arg("init").assert().success();
    cli_run(&repo_path)?.arg("init").assert().failure();
    Ok(())
}
