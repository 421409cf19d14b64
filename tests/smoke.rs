//! Smoke tests -- verify the binary runs and its subcommands are wired.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn runscope() -> Command {
    let mut cmd = Command::cargo_bin("runscope").unwrap();
    cmd.env_remove("RUNSCOPE_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    runscope()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Live test-run telemetry aggregator"));
}

#[test]
fn test_cli_version() {
    runscope()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("runscope"));
}

#[test]
fn test_serve_subcommand_exists() {
    runscope().args(["serve", "--help"]).assert().success();
}

#[test]
fn test_check_config_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    runscope()
        .current_dir(dir.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicates::str::contains("[hub]").and(predicates::str::contains(
            "enforce_monotonic_results = true",
        )));
}

#[test]
fn test_check_config_rejects_missing_file() {
    runscope()
        .args(["--config", "/nonexistent/runscope.toml", "check-config"])
        .assert()
        .failure();
}

#[test]
fn test_replay_json_report() {
    runscope()
        .arg("replay")
        .arg("--snapshot")
        .arg(fixture("run_42.json"))
        .arg("--events")
        .arg(fixture("events_42.jsonl"))
        .arg("--json")
        .assert()
        .success()
        .stdout(predicates::str::contains("\"runId\": 42").and(predicates::str::contains(
            "\"success\": 1",
        )));
}

#[test]
fn test_replay_table() {
    runscope()
        .arg("replay")
        .arg("--snapshot")
        .arg(fixture("run_42.json"))
        .arg("--events")
        .arg(fixture("events_42.jsonl"))
        .assert()
        .success()
        .stdout(predicates::str::contains("Test run 42").and(predicates::str::contains("Retry")));
}
