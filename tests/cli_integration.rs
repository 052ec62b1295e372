//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("servers.json");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("toolbridge").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("ask"));
}

#[test]
fn list_with_empty_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, r#"{"servers": []}"#);

    let mut cmd = Command::cargo_bin("toolbridge").unwrap();
    cmd.args(["list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No servers configured"));
}

#[test]
fn list_shows_configured_servers() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        r#"{
            "servers": [
                {"id": "db", "name": "Database", "transportKind": "stdio", "command": "db-server"},
                {"id": "docs", "name": "Docs", "transportKind": "http", "baseUrl": "http://localhost:8080/sse"}
            ]
        }"#,
    );

    let mut cmd = Command::cargo_bin("toolbridge").unwrap();
    cmd.args(["list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("db"))
        .stdout(predicate::str::contains("stdio"))
        .stdout(predicate::str::contains("http"));
}

#[test]
fn unknown_server_fails_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, r#"{"servers": []}"#);

    let mut cmd = Command::cargo_bin("toolbridge").unwrap();
    cmd.args(["start", "nope", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown server"));
}

#[test]
fn malformed_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "not json at all");

    let mut cmd = Command::cargo_bin("toolbridge").unwrap();
    cmd.args(["list", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}
