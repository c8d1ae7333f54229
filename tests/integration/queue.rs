#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::policy;
use notifyg::queue::PersistentQueue;
use tempfile::tempdir;

#[test]
fn entries_survive_a_daemon_restart() {
    let dir = tempdir().expect("failed to create tempdir");
    {
        let queue = PersistentQueue::new(dir.path().to_path_buf(), policy(&["mock1"]))
            .expect("queue should open");
        queue.enqueue("alice", "first").expect("enqueue");
        queue.enqueue("bob", "second").expect("enqueue");
    }

    // A fresh queue instance over the same directory sees the same state.
    let queue = PersistentQueue::new(dir.path().to_path_buf(), policy(&["mock1"]))
        .expect("queue should reopen");
    let entries = queue.iter_entries().expect("listing should work");
    assert_eq!(entries.len(), 2);
    let mut contacts: Vec<String> = entries
        .iter()
        .map(|entry| queue.contents(entry).expect("payload should read").0)
        .collect();
    contacts.sort();
    assert_eq!(contacts, vec!["alice".to_string(), "bob".to_string()]);
}

#[test]
fn payload_bytes_are_preserved() {
    let dir = tempdir().expect("failed to create tempdir");
    let queue = PersistentQueue::new(dir.path().to_path_buf(), policy(&["mock1"]))
        .expect("queue should open");
    let message = "line one\nline two\n\ttabbed\n";
    let entry = queue.enqueue("alice", message).expect("enqueue");
    let (contact, body) = queue.contents(&entry).expect("payload should read");
    assert_eq!(contact, "alice");
    assert_eq!(body, message);
}

#[test]
fn enqueue_with_giveup_policy_commits_at_step_zero() {
    let dir = tempdir().expect("failed to create tempdir");
    let queue = PersistentQueue::new(dir.path().to_path_buf(), policy(&["GIVEUP"]))
        .expect("queue should open");
    let entry = queue.enqueue("alice", "hi").expect("enqueue");
    // GIVEUP is not a wait, so nothing is pre-advanced.
    assert_eq!(entry.step(), 0);
    assert!(entry.sleep_duration().is_zero());
}

#[test]
fn lock_symlink_records_daemon_pid() {
    let dir = tempdir().expect("failed to create tempdir");
    let mut queue = PersistentQueue::new(dir.path().to_path_buf(), policy(&["mock1"]))
        .expect("queue should open");
    queue.lock().expect("lock should work");

    let target = fs::read_link(dir.path().join(".lock")).expect("lock symlink should exist");
    assert_eq!(
        target.to_string_lossy(),
        std::process::id().to_string()
    );

    queue.unlock();
    assert!(!dir.path().join(".lock").exists());
}

#[test]
fn advancing_renames_instead_of_rewriting() {
    let dir = tempdir().expect("failed to create tempdir");
    let queue = PersistentQueue::new(
        dir.path().to_path_buf(),
        policy(&["mock1", "60", "mock2"]),
    )
    .expect("queue should open");
    let entry = queue.enqueue("alice", "hi").expect("enqueue");
    let advanced = queue.entry_next(&entry, false).expect("advance");

    assert!(!dir.path().join(entry.file_name()).exists());
    assert!(dir.path().join(advanced.file_name()).exists());
    assert_eq!(entry.uid(), advanced.uid());
    // The payload traveled with the rename.
    let (contact, body) = queue.contents(&advanced).expect("payload should read");
    assert_eq!((contact.as_str(), body.as_str()), ("alice", "hi"));
}
