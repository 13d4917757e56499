use std::fs;

use anyhow::Result;
use predicates::prelude::*;
use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn check_is_clean_after_a_normal_backup() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");
    init_repo(&repo_path)?;

    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), b"hello, world!")?;
    cli_run(&repo_path)?.arg("backup").arg(source.path()).assert().success();

    cli_run(&repo_path)?
        .args(["check", "--read-data"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 error(s)"));

    Ok(())
}

#[test]
fn exclude_pattern_leaves_matching_files_out_of_the_snapshot() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");
    init_repo(&repo_path)?;

    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), b"keep me")?;
    fs::write(source.path().join("a.log"), b"drop me")?;

    cli_run(&repo_path)?
        .arg("backup")
        .arg(source.path())
        .args(["--exclude", r"\.log$"])
        .assert()
        .success();

    let list = cli_run(&repo_path)?.arg("snapshots").output()?;
    let stdout = String::from_utf8(list.stdout)?;
    let snapshot_id = stdout
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().next())
        .expect("at least one snapshot listed");

    let restored = tempdir()?;
    cli_run(&repo_path)?
        .args(["restore", snapshot_id, "--target"])
        .arg(restored.path())
        .assert()
        .success();

    let root_name = source.path().file_name().unwrap().to_str().unwrap();
    let restored_root = restored.path().join(root_name);
    assert!(restored_root.join("a.txt").exists());
    assert!(!restored_root.join("a.log").exists());

    Ok(())
}

#[test]
fn cat_config_dumps_the_repository_id_as_json() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");
    init_repo(&repo_path)?;

    cli_run(&repo_path)?
        .args(["cat", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("repository_id"));

    Ok(())
}

#[test]
fn cat_snapshot_dumps_the_tree_id_as_json() -> Result<()> {
    let parent = tempdir()?;
    let repo_path = parent.path().join("repo");
    init_repo(&repo_path)?;

    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), b"hello")?;
    cli_run(&repo_path)?.arg("backup").arg(source.path()).assert().success();

    let list = cli_run(&repo_path)?.arg("snapshots").output()?;
    let stdout = String::from_utf8(list.stdout)?;
    let snapshot_id = stdout
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().next())
        .expect("at least one snapshot listed");

    cli_run(&repo_path)?
        .args(["cat", "snapshot", snapshot_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tree\""));

    Ok(())
}
