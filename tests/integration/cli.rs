#[path = "common/mod.rs"]
mod common;

use std::{fs, os::unix::fs::symlink, path::Path};

use assert_cmd::Command;
use common::write_config;
use predicates::prelude::*;
use tempfile::tempdir;

fn nfyg() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("nfyg"))
}

fn committed_entries(queuedir: &Path) -> Vec<String> {
    fs::read_dir(queuedir)
        .expect("read_dir")
        .filter_map(|item| item.ok())
        .map(|item| item.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.') && !name.ends_with(".tmp"))
        .collect()
}

#[test]
fn help_lists_subcommands() {
    nfyg()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("clear"));
}

#[test]
fn send_list_clear_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let queuedir = temp.path().join("queue");
    fs::create_dir_all(&queuedir).expect("failed to create queuedir");
    let config = write_config(temp.path(), &queuedir, "\"mock1\"");

    nfyg()
        .arg("send")
        .arg("--config")
        .arg(&config)
        .arg("alice")
        .arg("disk")
        .arg("is")
        .arg("full")
        .assert()
        .success();
    let entries = committed_entries(&queuedir);
    assert_eq!(entries.len(), 1);
    let payload =
        fs::read_to_string(queuedir.join(&entries[0])).expect("payload should read");
    assert_eq!(payload, "alice\ndisk is full");

    nfyg()
        .arg("list")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("contact=alice"));

    nfyg()
        .arg("clear")
        .arg("--config")
        .arg(&config)
        .assert()
        .success();
    assert!(committed_entries(&queuedir).is_empty());
}

#[test]
fn send_rejects_unknown_contact() {
    let temp = tempdir().expect("failed to create tempdir");
    let queuedir = temp.path().join("queue");
    fs::create_dir_all(&queuedir).expect("failed to create queuedir");
    let config = write_config(temp.path(), &queuedir, "\"mock1\"");

    nfyg()
        .arg("send")
        .arg("--config")
        .arg(&config)
        .arg("mallory")
        .arg("hi")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("mallory"));
    assert!(committed_entries(&queuedir).is_empty());
}

#[test]
fn start_rejects_retry_with_unknown_provider() {
    let temp = tempdir().expect("failed to create tempdir");
    let queuedir = temp.path().join("queue");
    fs::create_dir_all(&queuedir).expect("failed to create queuedir");
    let config = write_config(temp.path(), &queuedir, "\"missing\"");

    nfyg()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn start_reports_lock_holder_and_exits() {
    let temp = tempdir().expect("failed to create tempdir");
    let queuedir = temp.path().join("queue");
    fs::create_dir_all(&queuedir).expect("failed to create queuedir");
    let config = write_config(temp.path(), &queuedir, "\"mock1\"");

    // Plant a live lock: our own test process holds it.
    let pid = std::process::id().to_string();
    symlink(&pid, queuedir.join(".lock")).expect("failed to plant lock");

    nfyg()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(3)
        .stderr(predicate::str::contains(pid.as_str()));
}

#[test]
fn missing_config_file_is_a_config_error() {
    nfyg()
        .arg("list")
        .arg("--config")
        .arg("/nonexistent/notifyg.yaml")
        .assert()
        .code(2);
}
