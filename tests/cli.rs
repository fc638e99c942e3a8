//! CLI integration tests.
//!
//! Each test uses an isolated temp directory for the database, ensuring
//! tests can run in parallel safely. Only commands that stay off the
//! network are exercised here.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::prelude::*;

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("gitvault").expect("failed to find binary");
        cmd.env("NO_COLOR", "1");
        cmd.arg("--data-dir").arg(self.data_dir());
        cmd
    }
}

#[test]
fn test_add_and_list() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["add", "https://github.com/octocat/Hello-World"])
        .assert()
        .success()
        .stdout(predicate::str::contains("octocat/hello-world"));

    ctx.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("octocat/hello-world"));
}

#[test]
fn test_add_duplicate_fails() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["add", "https://github.com/octocat/hello-world"])
        .assert()
        .success();

    // A differently-spelled but equivalent URL is still a duplicate.
    ctx.cmd()
        .args(["add", "http://github.com/OctoCat/Hello-World.git"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already tracked"));
}

#[test]
fn test_add_invalid_url_fails() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["add", "https://gitlab.com/owner/repo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid repository url"));
}

#[test]
fn test_list_empty() {
    let ctx = TestContext::new();

    ctx.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No repositories tracked"));
}

#[test]
fn test_list_status_filter() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["add", "https://github.com/octocat/hello-world"])
        .assert()
        .success();

    ctx.cmd()
        .args(["list", "--status", "active"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No repositories tracked"));

    ctx.cmd()
        .args(["list", "--status", "bogus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown status"));
}

#[test]
fn test_remove_repo() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["add", "https://github.com/octocat/hello-world"])
        .assert()
        .success();

    ctx.cmd()
        .args(["remove", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed repository 1"));

    ctx.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No repositories tracked"));
}

#[test]
fn test_remove_unknown_repo_fails() {
    let ctx = TestContext::new();

    ctx.cmd().args(["remove", "42"]).assert().failure();
}

#[test]
fn test_settings_show_and_set() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["setting", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_tasks"));

    ctx.cmd()
        .args(["setting", "set", "max_concurrent_tasks", "8"])
        .assert()
        .success();

    ctx.cmd()
        .args(["setting", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_concurrent_tasks\": 8"));
}

#[test]
fn test_setting_rejects_unknown_key() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["setting", "set", "favorite_color", "green"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown setting"));
}

#[test]
fn test_import_legacy_file() {
    let ctx = TestContext::new();

    let json_path = ctx.data_dir().join("legacy.json");
    std::fs::write(
        &json_path,
        r#"{
            "https://github.com/owner/repo": {
                "local_path": "data/owner_repo",
                "last_cloned": "2025-01-01 12:00:00",
                "status": "active",
                "description": "from the old tool"
            },
            "https://gitlab.com/not/github": {"status": "active"}
        }"#,
    )
    .unwrap();

    ctx.cmd()
        .arg("import")
        .arg(&json_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 1 repositories"))
        .stderr(predicate::str::contains("gitlab.com"));

    ctx.cmd()
        .args(["list", "--status", "active"])
        .assert()
        .success()
        .stdout(predicate::str::contains("owner/repo"));
}

#[test]
fn test_archives_empty() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["add", "https://github.com/octocat/hello-world"])
        .assert()
        .success();

    ctx.cmd()
        .args(["archives", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No snapshots yet"));
}
