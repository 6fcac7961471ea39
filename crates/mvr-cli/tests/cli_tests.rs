//! CLI integration tests.
//!
//! These exercise argument parsing and configuration validation; they do
//! not reach a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn mvr() -> Command {
    let mut cmd = Command::cargo_bin("mvr").expect("binary builds");
    cmd.env_remove("MVR_SOURCE");
    cmd.env_remove("MVR_DEST");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    mvr()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mv"))
        .stdout(predicate::str::contains("mvs"))
        .stdout(predicate::str::contains("exec"));
}

#[test]
fn test_version_output() {
    mvr()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mvr"));
}

#[test]
fn test_mv_requires_source_env() {
    mvr()
        .args(["--silent", "mv", "--name", "users", "--format", "csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MVR_SOURCE"));
}

#[test]
fn test_mv_requires_name_or_sql() {
    mvr()
        .args(["--silent", "mv", "--format", "csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("stream_name or sql"));
}

#[test]
fn test_mv_rejects_unknown_format() {
    mvr()
        .args(["--silent", "mv", "--name", "users", "--format", "xml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported format"));
}

#[test]
fn test_mv_rejects_bad_config_path() {
    mvr()
        .args(["--silent", "mv", "-f", "/nonexistent/config.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error reading config"));
}

#[test]
fn test_mv_rejects_invalid_yaml_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "stream_name: [unclosed").unwrap();

    mvr()
        .args(["--silent", "mv", "-f"])
        .arg(file.path())
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_mvs_requires_config_flag() {
    mvr()
        .args(["--silent", "mvs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn test_exec_requires_sql_flag() {
    mvr()
        .args(["--silent", "exec"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--sql"));
}

#[test]
fn test_unsupported_source_scheme() {
    let mut cmd = mvr();
    cmd.env("MVR_SOURCE", "mysql://localhost/db");
    cmd.env("MVR_DEST", "stdout://");
    cmd.args(["--silent", "mv", "--name", "users", "--format", "csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported source scheme"));
}

#[test]
fn test_config_error_exit_code() {
    mvr()
        .args(["--silent", "mv", "--name", "users", "--format", "csv"])
        .assert()
        .failure()
        .code(2);
}
