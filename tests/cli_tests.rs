//! CLI behavior tests against the built binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn taskmesh() -> Command {
    Command::cargo_bin("taskmesh").unwrap()
}

#[test]
fn structure_prints_the_demo_workspace() {
    taskmesh()
        .arg("structure")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"demo\""))
        .stdout(predicate::str::contains("\"sub\""));
}

#[test]
fn run_executes_a_dependency_chain() {
    taskmesh()
        .args(["run", "b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
}

#[test]
fn run_accepts_inline_meta() {
    taskmesh()
        .args(["run", "counted", "--meta", r#"{"count": 3}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("6"));
}

#[test]
fn run_accepts_meta_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.json");
    std::fs::write(&path, r#"{"count": 5}"#).unwrap();
    taskmesh()
        .args(["run", "counted", "--meta"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("10"));
}

#[test]
fn run_with_mistyped_meta_fails() {
    taskmesh()
        .args(["run", "counted", "--meta", r#"{"count": "three"}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn run_with_alternate_runner() {
    taskmesh()
        .args(["run", "reduce_map_numbers", "--runner", "threaded"])
        .assert()
        .success()
        .stdout(predicate::str::contains("55"));
}

#[test]
fn unknown_workspace_locator_fails() {
    taskmesh()
        .args(["--workspace", "nope", "structure"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn unknown_task_path_fails() {
    taskmesh()
        .args(["run", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn eval_mode_reports_json_on_stdout() {
    taskmesh()
        .args(["--workspace", "demo", "eval", "--task", "b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"contains_data\""))
        .stdout(predicate::str::contains("\"data\":2"));
}

#[test]
fn eval_mode_reports_failures_without_crashing() {
    taskmesh()
        .args(["--workspace", "demo", "eval", "--task", "ghost"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"failed\""));
}
