//! End-to-end tests for relive CLI argument handling.
//!
//! These run the binary against throwaway projects and only cover paths that
//! fail or finish before a build is started.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn relive() -> Command {
    Command::cargo_bin("relive").expect("Failed to find relive binary")
}

/// A minimal Cargo project.
fn project() -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    fs::write(
        temp_dir.path().join("Cargo.toml"),
        "[package]\nname = \"greeter\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
    )
    .expect("Failed to write manifest");
    fs::create_dir(temp_dir.path().join("src")).expect("Failed to create src");
    fs::write(temp_dir.path().join("src/main.rs"), "fn main() {}\n").expect("Failed to write main");
    temp_dir
}

#[test]
fn test_help_lists_commands() {
    relive()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("hooks"));
}

#[test]
fn test_hooks_lists_builtins() {
    relive()
        .arg("hooks")
        .assert()
        .success()
        .stdout(predicate::str::contains("health-check"))
        .stdout(predicate::str::contains("health-check-negative"))
        .stdout(predicate::str::contains("port-free"))
        .stdout(predicate::str::contains("shutdown"));
}

#[test]
fn test_setting_without_value_is_rejected() {
    relive()
        .args(["run", "--set", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn test_reload_on_request_requires_proxy() {
    relive()
        .args(["run", "--reload-on-request"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--proxy"));
}

#[test]
fn test_missing_manifest_dir() {
    let temp_dir = TempDir::new().unwrap();
    relive()
        .arg("run")
        .arg("--manifest-dir")
        .arg(temp_dir.path().join("missing"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Directory not found"));
}

#[test]
fn test_directory_without_cargo_toml() {
    let temp_dir = TempDir::new().unwrap();
    relive()
        .arg("run")
        .arg("--manifest-dir")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No Cargo.toml"));
}

#[test]
fn test_invalid_setting_value() {
    let project = project();
    relive()
        .arg("run")
        .arg("--manifest-dir")
        .arg(project.path())
        .args(["--set", "relive.http.port=eighty"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("relive.http.port"));
}

#[test]
fn test_unknown_hook_fails_before_build() {
    let project = project();
    relive()
        .arg("run")
        .arg("--manifest-dir")
        .arg(project.path())
        .args(["--startup-hook", "warp-drive"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown startup hook: warp-drive"));

    assert!(!project.path().join("target").exists());
}
