//! Integration tests for the dfm CLI binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_flow(dir: &std::path::Path, text: &str) {
    std::fs::write(dir.join("flow.yaml"), text).unwrap();
}

#[test]
fn test_run_simple_flow() {
    let dir = tempfile::tempdir().unwrap();
    write_flow(
        dir.path(),
        r#"
package:
  name: demo
  tasks:
    - name: hello
      run: echo hello > hello.txt
"#,
    );

    Command::cargo_bin("dfm")
        .unwrap()
        .current_dir(dir.path())
        .args(["run", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("done:"));

    assert!(dir.path().join("rundir/hello/hello.txt").exists());
    assert!(dir.path().join("rundir/hello/hello.log").exists());
}

#[test]
fn test_run_failing_task_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    write_flow(
        dir.path(),
        r#"
package:
  name: demo
  tasks:
    - name: boom
      run: exit 7
"#,
    );

    Command::cargo_bin("dfm")
        .unwrap()
        .current_dir(dir.path())
        .args(["run", "boom"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("failed:"));
}

#[test]
fn test_run_unknown_task_suggests() {
    let dir = tempfile::tempdir().unwrap();
    write_flow(
        dir.path(),
        r#"
package:
  name: demo
  tasks:
    - name: compile
      run: echo c
"#,
    );

    Command::cargo_bin("dfm")
        .unwrap()
        .current_dir(dir.path())
        .args(["run", "compiel"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("compile"));
}

#[test]
fn test_show_lists_graph() {
    let dir = tempfile::tempdir().unwrap();
    write_flow(
        dir.path(),
        r#"
package:
  name: demo
  tasks:
    - name: a
      run: echo a
    - name: b
      needs: [a]
      run: echo b
"#,
    );

    Command::cargo_bin("dfm")
        .unwrap()
        .current_dir(dir.path())
        .args(["show", "b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("demo.b").and(predicate::str::contains("demo.a")));
}

#[test]
fn test_show_dot_format() {
    let dir = tempfile::tempdir().unwrap();
    write_flow(
        dir.path(),
        r#"
package:
  name: demo
  tasks:
    - name: a
      run: echo a
"#,
    );

    Command::cargo_bin("dfm")
        .unwrap()
        .current_dir(dir.path())
        .args(["show", "a", "--dot"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("digraph G {"));
}
