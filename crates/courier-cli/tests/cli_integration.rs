//! CLI integration tests
//!
//! Everything here runs without a reachable relay: identity creation,
//! conversation management, and timeline reads are offline-first by
//! design. Commands that need the relay are covered by the core crate's
//! integration tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn courier(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("courier").unwrap();
    cmd.arg("--data-dir").arg(temp.path());
    // A relay nothing listens on: every network touch is a fast transient
    cmd.arg("--relay-url").arg("http://127.0.0.1:1");
    cmd
}

#[test]
fn test_help_shows_usage() {
    Command::cargo_bin("courier")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("offline-first encrypted chat sync"));
}

#[test]
fn test_identity_show_creates_identity() {
    let temp = TempDir::new().unwrap();
    courier(&temp)
        .args(["identity", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Peer ID:"))
        .stdout(predicate::str::contains("Fingerprint:"));
}

#[test]
fn test_identity_stable_across_invocations() {
    let temp = TempDir::new().unwrap();

    let first = courier(&temp).args(["identity", "show"]).output().unwrap();
    let second = courier(&temp).args(["identity", "show"]).output().unwrap();

    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn test_conversation_create_and_list_offline() {
    let temp = TempDir::new().unwrap();

    // Creation works offline; session establishment is deferred
    courier(&temp)
        .args(["conversation", "create", "some-peer-id"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created conversation"))
        .stdout(predicate::str::contains("deferred"));

    courier(&temp)
        .args(["conversation", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 participants"));
}

#[test]
fn test_conversation_show_details() {
    let temp = TempDir::new().unwrap();

    let output = courier(&temp)
        .args(["conversation", "create", "some-peer-id"])
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    let conversation_id = stdout
        .lines()
        .next()
        .unwrap()
        .strip_prefix("Created conversation ")
        .unwrap()
        .trim()
        .to_string();

    courier(&temp)
        .args(["conversation", "show", &conversation_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cursor: 0"))
        .stdout(predicate::str::contains("(me)"))
        .stdout(predicate::str::contains("some-peer-id"));

    courier(&temp)
        .args(["message", "timeline", &conversation_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("No messages."));
}

#[test]
fn test_unknown_conversation_fails() {
    let temp = TempDir::new().unwrap();
    courier(&temp)
        .args(["conversation", "show", "01ARZ3NDEKTSV4RRFFQ69G5FAV"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Conversation not found"));
}

#[test]
fn test_invalid_id_rejected() {
    let temp = TempDir::new().unwrap();
    courier(&temp)
        .args(["conversation", "show", "not-a-ulid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid conversation id"));
}

#[test]
fn test_sync_status_offline() {
    let temp = TempDir::new().unwrap();
    courier(&temp)
        .args(["sync", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status:"));
}
