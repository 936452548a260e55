//! State store integration against real git repositories: commit-notes and
//! state-branch backings, envelope monotonicity, and CAS conflicts across
//! independent store instances.

use std::path::Path;
use std::process::Command;

use serde_json::json;

use architect::config::StateBackendMode;
use architect::state_store::{Namespace, StateError, StateStore};

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "init"]);
}

#[test]
fn notes_mode_round_trips_and_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let store =
        StateStore::open(dir.path(), StateBackendMode::Notes, "architect/state").unwrap();
    assert!(store.git_enabled());
    store
        .set(Namespace::Context, &json!({"goal": "notes demo"}), None)
        .unwrap();

    // The note ref exists and a second instance sees the same envelope.
    let refs = git(dir.path(), &["show-ref"]);
    assert!(refs.contains("refs/notes/architect/context"));

    let reopened =
        StateStore::open(dir.path(), StateBackendMode::Notes, "architect/state").unwrap();
    let envelope = reopened.envelope(Namespace::Context).unwrap();
    assert_eq!(envelope.revision, 2);
    assert_eq!(envelope.data["goal"], "notes demo");
}

#[test]
fn notes_mode_cas_conflict_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let store_a =
        StateStore::open(dir.path(), StateBackendMode::Notes, "architect/state").unwrap();
    let store_b =
        StateStore::open(dir.path(), StateBackendMode::Notes, "architect/state").unwrap();

    let stale = store_a.envelope(Namespace::Metrics).unwrap();
    store_b
        .set(Namespace::Metrics, &json!({"writer": "b"}), None)
        .unwrap();

    let err = store_a
        .set(Namespace::Metrics, &json!({"writer": "a"}), Some(stale.revision))
        .unwrap_err();
    assert!(matches!(err, StateError::Concurrency(_)));

    // The losing writer's data never landed.
    let envelope = store_a.envelope(Namespace::Metrics).unwrap();
    assert_eq!(envelope.data["writer"], "b");
}

#[test]
fn notes_revision_only_increases() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let store =
        StateStore::open(dir.path(), StateBackendMode::Notes, "architect/state").unwrap();

    let mut last = store.envelope(Namespace::Tasks).unwrap().revision;
    for i in 0..5 {
        store
            .set(Namespace::Tasks, &json!({"iteration": i}), None)
            .unwrap();
        let revision = store.envelope(Namespace::Tasks).unwrap().revision;
        assert!(revision > last, "revision must increase");
        last = revision;
    }
}

#[test]
fn branch_mode_builds_commits_without_touching_the_worktree() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let store =
        StateStore::open(dir.path(), StateBackendMode::Branch, "architect/state").unwrap();

    store
        .set(Namespace::Context, &json!({"goal": "branch demo"}), None)
        .unwrap();
    store
        .set(Namespace::Decisions, &json!({"decisions": []}), None)
        .unwrap();
    store
        .set(Namespace::Context, &json!({"goal": "branch demo 2"}), None)
        .unwrap();

    // One commit per update, parent-linked on the dedicated ref.
    let count = git(dir.path(), &["rev-list", "--count", "refs/heads/architect/state"]);
    assert_eq!(count, "3");

    // The tree carries one JSON blob per namespace.
    let context_blob = git(
        dir.path(),
        &["show", "refs/heads/architect/state:context.json"],
    );
    let envelope: serde_json::Value = serde_json::from_str(&context_blob).unwrap();
    assert_eq!(envelope["data"]["goal"], "branch demo 2");
    assert_eq!(envelope["revision"], 3);
    let decisions_blob = git(
        dir.path(),
        &["show", "refs/heads/architect/state:decisions.json"],
    );
    assert!(decisions_blob.contains("decisions"));

    // The checked-out branch and worktree are untouched.
    let branch = git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(branch, "main");
    let status = git(dir.path(), &["status", "--porcelain"]);
    for line in status.lines() {
        assert!(
            line.contains(".architect"),
            "unexpected worktree change: {line}"
        );
    }
}

#[test]
fn branch_mode_update_retries_are_transparent() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let store =
        StateStore::open(dir.path(), StateBackendMode::Branch, "architect/state").unwrap();

    #[derive(Default, serde::Serialize, serde::Deserialize)]
    struct Counter {
        #[serde(default)]
        n: u64,
    }

    for _ in 0..3 {
        store
            .update(Namespace::Metrics, |mut counter: Counter| {
                counter.n += 1;
                counter
            })
            .unwrap();
    }
    let counter: Counter = store.data(Namespace::Metrics).unwrap();
    assert_eq!(counter.n, 3);
}
