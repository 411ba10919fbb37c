//! End-to-end checks of the `mantra` binary.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("mantra-cli-tests");
    fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join(name);
    fs::write(&path, contents).expect("write temp file");
    path
}

fn mantra() -> Command {
    Command::cargo_bin("mantra").expect("binary")
}

#[test]
fn expands_a_simple_source() {
    let input = write_temp(
        "simple.asm",
        "%macro M 1\ndb %1\n%endmacro\nM 42\n",
    );
    mantra()
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("db 42"));
}

#[test]
fn predefines_from_the_command_line() {
    let input = write_temp(
        "predef.asm",
        "%if VER = 3\nthree\n%else\nother\n%endif\n",
    );
    mantra()
        .arg(&input)
        .args(["-D", "VER=3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("three").and(predicate::str::contains("other").not()));
}

#[test]
fn warnings_go_to_stderr() {
    let input = write_temp(
        "warn.asm",
        "%define f(x) x\ndb f(1, 2)\n",
    );
    mantra()
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("not taking 2 parameters"));
}

#[test]
fn nonfatal_errors_fail_the_run() {
    let input = write_temp("err.asm", "%error \"boom\"\n");
    mantra()
        .arg(&input)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("boom"));
}

#[test]
fn fatal_errors_abort() {
    let input = write_temp("fatal.asm", "%endif\n");
    mantra()
        .arg(&input)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no matching"));
}

#[test]
fn dependency_mode_lists_includes() {
    let dir = std::env::temp_dir().join("mantra-cli-tests");
    fs::create_dir_all(&dir).expect("create temp dir");
    fs::write(dir.join("dep.inc"), "%define D 1\n").expect("write include");
    let input = write_temp("deps.asm", "%include \"dep.inc\"\ndb D\n");
    mantra()
        .arg(&input)
        .arg("-M")
        .arg("-I")
        .arg(&dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("dep.inc").and(predicate::str::contains("db").not()));
}
