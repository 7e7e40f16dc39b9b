//! Command line behavior of the `foldsync` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foldsync(data: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("foldsync").unwrap();
    cmd.arg("--data-dir").arg(data.path());
    cmd
}

#[test]
fn status_before_init() {
    let data = TempDir::new().unwrap();
    foldsync(&data)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("NOT INITIALIZED"));
}

#[test]
fn init_add_scan_index() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    std::fs::write(base.path().join("notes.txt"), b"hello").unwrap();

    foldsync(&data)
        .args(["init", "--name", "desk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Device initialized"));

    foldsync(&data)
        .args(["add-folder", "notes"])
        .arg(base.path())
        .args(["--profile", "backup-source"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backup-source"));

    foldsync(&data)
        .arg("scan")
        .assert()
        .success()
        .stdout(predicate::str::contains("notes: 1 files"));

    foldsync(&data)
        .args(["index", "notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("notes.txt"));
}

#[test]
fn unknown_profile_is_rejected() {
    let data = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    foldsync(&data)
        .args(["init", "--name", "desk"])
        .assert()
        .success();
    foldsync(&data)
        .args(["add-folder", "x"])
        .arg(base.path())
        .args(["--profile", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown profile"));
}
