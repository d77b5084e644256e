#![allow(dead_code)]

use harness::TestHarness;
use predicates::prelude::*;

fn shout_pipeline(h: &TestHarness, command: &str) -> std::path::PathBuf {
    let input = h.write_input("greeting.txt", "hello\n");
    let content = format!(
        r#"
[[stage]]
name = "src"
[[stage.input]]
tags = {{ sample = "s1" }}
files = [{{ name = "data", path = "{}" }}]

[[stage]]
name = "shout"
parents = ["src"]
command = "{}"
[[stage.outputs]]
name = "txt"
path = "shout.txt"
persist = true
"#,
        input.display(),
        command
    );
    h.write_pipeline("shout.toml", &content)
}

#[test]
fn test_run_executes_pipeline_and_reports_status() {
    let h = TestHarness::new();
    let pipeline = shout_pipeline(&h, "tr a-z A-Z < {in.data} > $OUT.txt");

    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow 'shout' completed"));

    let out = h
        .workflow_dir("shout")
        .join("shout")
        .join("sample-s1")
        .join("shout.txt");
    assert_eq!(h.read(&out), "HELLO\n");

    h.cmd()
        .args(["status", "--name", "shout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shout"))
        .stdout(predicate::str::contains("successful"));

    let snapshot = h.snapshot("shout");
    assert!(snapshot.is_object());
}

#[test]
fn test_second_run_reuses_successful_tasks() {
    let h = TestHarness::new();
    let pipeline = shout_pipeline(&h, "tr a-z A-Z < {in.data} > $OUT.txt");

    h.cmd().arg("run").arg(&pipeline).assert().success();
    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 task(s) run, 2 reused"));
}

#[test]
fn test_failing_task_exits_non_zero() {
    let h = TestHarness::new();
    let pipeline = shout_pipeline(&h, "echo broken >&2; exit 3 # $OUT.txt");

    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .args(["--max-reattempts", "0"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("[ERROR]"))
        .stderr(predicate::str::contains("failed after 1 attempt(s)"));

    h.cmd()
        .args(["status", "--name", "shout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed"));
}

#[test]
fn test_dry_run_lists_commands_without_running() {
    let h = TestHarness::new();
    let pipeline = shout_pipeline(&h, "tr a-z A-Z < {in.data} > $OUT.txt");

    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("DRY"))
        .stdout(predicate::str::contains("1 task(s) would be submitted"));

    let out = h
        .workflow_dir("shout")
        .join("shout")
        .join("sample-s1")
        .join("shout.txt");
    assert!(!out.exists());
}

#[test]
fn test_dry_run_restart_leaves_previous_results() {
    let h = TestHarness::new();
    let pipeline = shout_pipeline(&h, "tr a-z A-Z < {in.data} > $OUT.txt");
    h.cmd().arg("run").arg(&pipeline).assert().success();
    let before = h.snapshot("shout");

    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .args(["--restart", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 task(s) would be submitted"));

    let out = h
        .workflow_dir("shout")
        .join("shout")
        .join("sample-s1")
        .join("shout.txt");
    assert_eq!(h.read(&out), "HELLO\n");
    assert_eq!(h.snapshot("shout"), before);

    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 task(s) run, 2 reused"));
}

#[test]
fn test_status_of_unknown_workflow_fails() {
    let h = TestHarness::new();
    h.cmd()
        .args(["status", "--name", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("[ERROR]"))
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_invalid_pipeline_is_rejected() {
    let h = TestHarness::new();
    let pipeline = h.write_pipeline(
        "cyclic.toml",
        r#"
[[stage]]
name = "a"
parents = ["b"]
command = "true"

[[stage]]
name = "b"
parents = ["a"]
command = "true"
"#,
    );
    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .assert()
        .failure()
        .stderr(predicate::str::contains("[ERROR]"));
}

#[test]
fn test_unknown_drm_is_rejected() {
    let h = TestHarness::new();
    let pipeline = shout_pipeline(&h, "tr a-z A-Z < {in.data} > $OUT.txt");
    h.cmd()
        .arg("run")
        .arg(&pipeline)
        .args(["--drm", "lsf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lsf"));
}
