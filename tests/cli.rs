//! CLI surface tests

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

const SCRIPT: &str = "let x = 20\nlet y = 22\nprint(x + y)\nreturn x + y\n";

const CONTRACT: &str = "\
type Storage = { count: int }\n\
var M: Contract<Storage> = {}\n\
function M:init()\n\
    self.storage.count = 41\n\
end\n\
function M:bump(_: string)\n\
    self.storage.count = self.storage.count + 1\n\
end\n\
return M\n";

#[test]
fn test_run_executes_source() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("answer.gls");
    fs::write(&path, SCRIPT).unwrap();

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["run", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn test_compile_then_disasm_round_trip() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("answer.gls");
    let module_path = dir.path().join("answer.csbc");
    fs::write(&source_path, SCRIPT).unwrap();

    Command::cargo_bin("chainscript")
        .unwrap()
        .args([
            "compile",
            source_path.to_str().unwrap(),
            "-o",
            module_path.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("compiled"));

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["disasm", module_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("LOADK"));

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["decompile", module_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("return"));
}

#[test]
fn test_check_reports_type_errors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.gls");
    fs::write(&path, "let x = 1 + \"nope\"\n").unwrap();

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["check", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("operator '+'"));
}

#[test]
fn test_call_invokes_contract_api() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("counter.gls");
    fs::write(&path, CONTRACT).unwrap();

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["call", path.to_str().unwrap(), "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("committed true"));
}

#[test]
fn test_run_respects_instruction_limit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("spin.gls");
    fs::write(&path, "while true do\nend\n").unwrap();

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["run", path.to_str().unwrap(), "--limit", "100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("100 instructions"));
}

#[test]
fn test_disasm_rejects_foreign_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.csbc");
    fs::write(&path, b"not a module stream").unwrap();

    Command::cargo_bin("chainscript")
        .unwrap()
        .args(["disasm", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad magic"));
}
