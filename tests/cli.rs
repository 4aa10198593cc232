//! Command line driver

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn safepy() -> Command {
    let mut cmd = Command::cargo_bin("safepy").unwrap();
    for var in [
        "SAFEPY_ALLOW_IMPORTS",
        "SAFEPY_CONFIG",
        "SAFEPY_MAX_OPERATIONS",
        "SAFEPY_SEED",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_exec_prints_logs_then_value() {
    safepy()
        .args(["exec", "print('hi')\n[1, 2][-1] * 21"])
        .assert()
        .success()
        .stdout("hi\n42\n");
}

#[test]
fn test_exec_json_output() {
    let output = safepy()
        .args(["--json", "exec", "print('x')\nfinal_answer({'n': 1})"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["value"], serde_json::json!({"n": 1}));
    assert_eq!(parsed["logs"], "x\n");
    assert_eq!(parsed["is_final_answer"], true);
}

#[test]
fn test_exec_reads_stdin() {
    safepy()
        .args(["exec", "-"])
        .write_stdin("total = 0\nfor i in range(4):\n    total += i\ntotal\n")
        .assert()
        .success()
        .stdout("6\n");
}

#[test]
fn test_import_error_exit_status() {
    safepy()
        .args(["exec", "print('before')\nimport os"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("before"))
        .stdout(predicate::str::contains("ImportRestrictionError"));
}

#[test]
fn test_json_error_report() {
    let output = safepy()
        .args(["--json", "exec", "1 / 0"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["error"]["kind"], "Arithmetic");
    assert_eq!(parsed["error"]["line"], 1);
}

#[test]
fn test_allow_import_and_vars() {
    safepy()
        .args([
            "--allow-import",
            "statistics",
            "--var",
            "data=[2, 4, 9]",
            "--var",
            "who=world",
            "exec",
            "import statistics\nprint('hello', who)\nstatistics.mean(data)",
        ])
        .assert()
        .success()
        .stdout("hello world\n5\n");
}

#[test]
fn test_run_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "def square(x):\n    return x * x\n\nsquare(12)").unwrap();
    safepy()
        .arg("run")
        .arg(file.path())
        .assert()
        .success()
        .stdout("144\n");
}

#[test]
fn test_run_missing_file() {
    safepy()
        .args(["run", "/definitely/not/here.py"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_check_reports_warnings_and_errors() {
    safepy()
        .args(["check", "sum = 1"])
        .assert()
        .success()
        .stdout("OK (1 warnings)\n")
        .stderr(predicate::str::contains("shadows a builtin"));

    safepy()
        .args(["check", "x.__class__"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("SyntaxRestrictionError"));
}

#[test]
fn test_check_ast_dump() {
    safepy()
        .args(["check", "--ast", "x = 1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"Assign\""));
}

#[test]
fn test_imports_listing() {
    safepy()
        .arg("imports")
        .assert()
        .success()
        .stdout(predicate::str::contains("math\n"))
        .stdout(predicate::str::contains("statistics").not());
}

#[test]
fn test_limit_flag() {
    safepy()
        .args(["--max-while-iterations", "10", "exec", "n = 0\nwhile n < 100:\n    n += 1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("maximum of 10 iterations"));
}

#[test]
fn test_config_file() {
    let mut config = NamedTempFile::new().unwrap();
    write!(config, r#"{{"allowed_imports": ["copy"], "random_seed": 1}}"#).unwrap();
    safepy()
        .arg("--config")
        .arg(config.path())
        .args(["exec", "import copy\ncopy.deepcopy([[1]])"])
        .assert()
        .success()
        .stdout("[[1]]\n");
}
