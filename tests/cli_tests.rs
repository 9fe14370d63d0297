//! Integration tests for the installer CLI surface.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn dc_installer() -> Command {
    Command::cargo_bin("dc-installer").expect("dc-installer binary should exist")
}

#[test]
fn no_args_shows_help_and_exits_two() {
    // clap with arg_required_else_help shows help on stderr and exits 2
    dc_installer()
        .assert()
        .code(2)
        .stderr(predicate::str::contains(
            "Install and verify a Dragonchain node on Kubernetes",
        ));
}

#[test]
fn help_flag_lists_commands() {
    dc_installer()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("version"));
}

#[test]
fn version_flag_shows_version() {
    dc_installer()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn version_command_prints_bare_version() {
    dc_installer()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_subcommand_is_rejected() {
    dc_installer()
        .arg("uninstall")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
