//! Client argument and exit-code surface.

#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::HomeEnvGuard;
use predicates::prelude::*;
use tempfile::tempdir;

fn initg() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("initg"))
}

#[test]
fn help_lists_the_command_surface() {
    initg()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("runlevel"))
        .stdout(predicate::str::contains("cond"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    initg().arg("frobnicate").assert().code(2);
}

#[test]
fn status_without_a_supervisor_fails() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());

    initg()
        .arg("status")
        .env("HOME", temp.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no status available"));
}

#[test]
fn start_without_a_supervisor_fails() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());

    initg()
        .args(["start", "foo"])
        .env("HOME", temp.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not running"));
}

#[test]
fn invalid_signal_name_maps_to_the_conversion_exit_code() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());

    initg()
        .args(["signal", "foo", "SIGBOGUS"])
        .env("HOME", temp.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("invalid signal"));
}

#[test]
fn out_of_range_runlevel_is_a_usage_error() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());

    initg()
        .args(["runlevel", "42"])
        .env("HOME", temp.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid runlevel"));
}

#[test]
fn user_conditions_round_trip_through_the_filesystem() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());

    // Absent: off, exit 1.
    initg()
        .args(["cond", "get", "usr/ready"])
        .env("HOME", temp.path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("off"));

    // Set writes the usr/ entry even with no supervisor running.
    initg()
        .args(["cond", "set", "ready"])
        .env("HOME", temp.path())
        .assert()
        .success();
    let cond_file = temp
        .path()
        .join(".local/share/initg/run/cond/usr/ready");
    assert!(cond_file.exists());

    initg()
        .args(["cond", "get", "usr/ready"])
        .env("HOME", temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("on"));

    initg()
        .args(["cond", "show"])
        .env("HOME", temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("usr/ready"));

    initg()
        .args(["cond", "clear", "ready"])
        .env("HOME", temp.path())
        .assert()
        .success();
    assert!(!cond_file.exists());
}

#[test]
fn status_reads_a_persisted_snapshot() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());

    let state_dir = temp.path().join(".local/share/initg");
    fs::create_dir_all(&state_dir).expect("state dir");
    fs::write(
        state_dir.join("services.json"),
        r#"{
          "runlevel": 2,
          "previous": 0,
          "generated_at": "2026-01-01T00:00:00Z",
          "services": [{
            "ident": "web",
            "cmd": "/usr/sbin/httpd",
            "kind": "service",
            "state": "running",
            "pid": 1234,
            "uptime_secs": 90,
            "restart_cnt": 0,
            "total_restarts": 1,
            "crashed": false,
            "last_exit": null,
            "desc": "Web server"
          }]
        }"#,
    )
    .expect("write snapshot");

    initg()
        .arg("status")
        .env("HOME", temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("runlevel 2"))
        .stdout(predicate::str::contains("web"))
        .stdout(predicate::str::contains("running"))
        .stdout(predicate::str::contains("1234"));

    initg()
        .args(["status", "--json"])
        .env("HOME", temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ident\": \"web\""));

    initg()
        .args(["status", "ghost"])
        .env("HOME", temp.path())
        .assert()
        .code(69)
        .stderr(predicate::str::contains("no such service"));

    initg()
        .args(["ident"])
        .env("HOME", temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("web"));
}
