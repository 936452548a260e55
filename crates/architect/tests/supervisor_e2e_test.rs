//! Supervisor end-to-end slices with a scripted specialist team.
//!
//! The backend is deterministic: it answers per task type and, for implement
//! tasks, writes real files into the scratch repository so patch staging,
//! guardrails, and gates run against genuine worktree changes. No inference
//! or external agent binaries are involved.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use architect::backends::{AgentBackend, BackendContext, BackendError};
use architect::config::{ArchitectConfig, StateBackendMode};
use architect::contracts::{
    now_iso, CheckpointsPayload, Lease, LeasesPayload, Metrics, RunContext, RunStatus,
    RunsPayload,
};
use architect::patch_stack::PatchStack;
use architect::specialists::SpecialistSet;
use architect::state_store::{Namespace, StateStore};
use architect::supervisor::Supervisor;

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

/// Deterministic team: plan/test/review/document are canned; implement writes
/// a source file plus a matching test file into the repository.
struct ScriptedTeam {
    repo: PathBuf,
}

#[async_trait]
impl AgentBackend for ScriptedTeam {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        context: &BackendContext,
        _tools: Option<&[String]>,
    ) -> Result<Vec<String>, BackendError> {
        let task_type = context
            .get("task")
            .and_then(|task| task.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("");
        match task_type {
            "plan" => Ok(vec![
                "- Implement core flow\n- Add validation".to_string(),
            ]),
            "implement" => {
                let task_id = context
                    .get("task")
                    .and_then(|task| task.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or("task");
                let slug = task_id.replace('-', "_");
                std::fs::create_dir_all(self.repo.join("src")).unwrap();
                std::fs::write(
                    self.repo.join("src").join(format!("{slug}.rs")),
                    "pub fn generated() {}\n",
                )
                .unwrap();
                std::fs::create_dir_all(self.repo.join("tests")).unwrap();
                std::fs::write(
                    self.repo.join("tests").join(format!("{slug}_test.rs")),
                    "#[test]\nfn generated_ok() {}\n",
                )
                .unwrap();
                Ok(vec![format!("Implemented {task_id} with tests.")])
            }
            "test" => Ok(vec!["Ran the suite; everything passes.".to_string()]),
            "review" => Ok(vec!["MINOR: Naming could be improved".to_string()]),
            "document" => Ok(vec![
                "Updated the README and docs for the new flow.".to_string(),
            ]),
            // Supervisor decomposition, replans, conflict advisors.
            _ => Ok(vec!["- fallback step".to_string()]),
        }
    }
}

fn test_config() -> ArchitectConfig {
    let mut config = ArchitectConfig::default();
    // Binaries that exist everywhere; the scripted team never spawns them.
    config.backend.primary = "sh".into();
    config.backend.fallback = "echo".into();
    config.backend.timeout_seconds = 30.0;
    config.project.lint_command = "true".into();
    config.project.type_check_command = String::new();
    config.project.test_command = "true".into();
    config.workflow.task_retry_backoff_seconds = 0.0;
    config.state.backend = StateBackendMode::Notes;
    config
}

fn build_supervisor(dir: &Path, config: ArchitectConfig) -> (Arc<StateStore>, Supervisor) {
    let state = Arc::new(
        StateStore::open(dir, config.state.backend, &config.state.branch_ref).unwrap(),
    );
    let patches = Arc::new(PatchStack::new(dir, Some(state.clone())).unwrap());
    let backend: Arc<dyn AgentBackend> = Arc::new(ScriptedTeam {
        repo: dir.to_path_buf(),
    });
    let specialists = SpecialistSet::build(backend, &config.agents, dir);
    let supervisor = Supervisor::new(state.clone(), patches, specialists, config, dir);
    (state, supervisor)
}

#[tokio::test]
async fn happy_path_run_completes_all_gates() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let (state, supervisor) = build_supervisor(dir.path(), test_config());

    let summary = supervisor
        .run("Ship the core flow with validation", false)
        .await
        .expect("run succeeds");

    // plan + 2 implements + test + review + document
    assert_eq!(summary.total_tasks, 6);
    assert!(summary.completed_tasks >= 5);
    let checkpoint = summary.checkpoint_id.expect("final checkpoint");
    assert!(checkpoint.contains("-complete"));

    let context: RunContext = state.data(Namespace::Context).unwrap();
    assert_eq!(context.status, RunStatus::Complete);
    assert!(context.session.ended_at.is_some());
    assert!(!context.session.patch_stack.is_empty());
    for patch in &context.session.patch_stack {
        assert!(patch.patch_id.starts_with("patch-"));
        let suffix = &patch.patch_id["patch-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    let metrics: Metrics = state.data(Namespace::Metrics).unwrap();
    assert!(metrics.quality_gates.len() >= 5);
    assert!(metrics.quality_gates.iter().all(|gate| gate.passed));
    assert_eq!(metrics.last_run_id.as_deref(), Some(summary.run_id.as_str()));
    // This run's patches carry the terminal checkpoint.
    assert!(metrics
        .patch_stack
        .iter()
        .filter(|p| p.run_id.as_deref() == Some(summary.run_id.as_str()))
        .all(|p| p.checkpoint_id.as_deref() == Some(checkpoint.as_str())));

    // Lease released, run record closed out.
    let leases: LeasesPayload = state.data(Namespace::Leases).unwrap();
    assert!(leases.active.is_none());
    let runs: RunsPayload = state.data(Namespace::Runs).unwrap();
    assert_eq!(runs.get(&summary.run_id).unwrap().status, RunStatus::Complete);

    // The run happened on an auxiliary branch.
    let branch = git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert!(branch.starts_with("architect/run-"));
}

#[tokio::test]
async fn failing_test_command_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let mut config = test_config();
    config.project.test_command = "false".into();
    let (state, supervisor) = build_supervisor(dir.path(), config);

    let err = supervisor
        .run("Ship something that cannot pass", false)
        .await
        .expect_err("run must fail");
    assert!(err.to_string().contains("Quality gate failed"));
    assert!(err.to_string().contains("testing_gate"));

    let context: RunContext = state.data(Namespace::Context).unwrap();
    assert_eq!(context.status, RunStatus::Failed);

    let metrics: Metrics = state.data(Namespace::Metrics).unwrap();
    assert!(!metrics.gate_failures.is_empty());
    assert!(metrics
        .gate_failures
        .iter()
        .any(|failure| failure.name == "testing_gate"));
    // Gate retries were attempted before giving up.
    assert!(metrics.task_retry_count >= 1);

    let checkpoints: CheckpointsPayload = state.data(Namespace::Checkpoints).unwrap();
    assert!(checkpoints
        .checkpoints
        .iter()
        .any(|cp| cp.failure_reason.is_some()));

    let leases: LeasesPayload = state.data(Namespace::Leases).unwrap();
    assert!(leases.active.is_none());
}

#[tokio::test]
async fn coverage_threshold_failure_names_both_numbers() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let mut config = test_config();
    config.project.test_command = "echo coverage: 72%".into();
    config.workflow.test_coverage_threshold = 80;
    let (state, supervisor) = build_supervisor(dir.path(), config);

    let err = supervisor
        .run("Raise the bar", false)
        .await
        .expect_err("run must fail on coverage");
    let message = err.to_string();
    assert!(message.contains("80"), "message was {message}");
    assert!(message.contains("72"), "message was {message}");

    let metrics: Metrics = state.data(Namespace::Metrics).unwrap();
    let failure = metrics
        .gate_failures
        .iter()
        .find(|failure| failure.name == "testing_gate")
        .expect("coverage failure recorded");
    assert!(failure.reason.contains("80"));
    assert!(failure.reason.contains("72"));
}

#[tokio::test]
async fn live_foreign_lease_blocks_a_fresh_run() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let (state, supervisor) = build_supervisor(dir.path(), test_config());

    state
        .set(
            Namespace::Leases,
            &LeasesPayload {
                active: Some(Lease {
                    run_id: "run-other".into(),
                    heartbeat_at: now_iso(),
                    expires_epoch: chrono::Utc::now().timestamp() + 3600,
                    task_id: None,
                }),
            },
            None,
        )
        .unwrap();

    let err = supervisor
        .run("Should not start", false)
        .await
        .expect_err("lease conflict");
    assert!(err.to_string().contains("lease"));
}

#[tokio::test]
async fn paused_workflow_refuses_to_run() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let (state, supervisor) = build_supervisor(dir.path(), test_config());

    state
        .update(Namespace::Context, |mut ctx: RunContext| {
            ctx.paused = true;
            ctx.status = RunStatus::Paused;
            ctx
        })
        .unwrap();

    let err = supervisor
        .run("Anything", false)
        .await
        .expect_err("paused workflow refuses");
    assert!(err.to_string().contains("paused"));
}

#[tokio::test]
async fn dirty_worktree_refuses_by_default() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    std::fs::write(dir.path().join("uncommitted.txt"), "dirt\n").unwrap();
    let (_state, supervisor) = build_supervisor(dir.path(), test_config());

    let err = supervisor
        .run("Anything", false)
        .await
        .expect_err("dirty worktree refuses");
    let message = err.to_string();
    assert!(message.contains("dirty worktree"));
    assert!(message.contains("uncommitted.txt"));
}

#[tokio::test]
async fn dirty_worktree_isolate_mode_excludes_paths_from_patches() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    std::fs::write(dir.path().join("scratch.txt"), "pre-existing dirt\n").unwrap();
    let mut config = test_config();
    config.workflow.dirty_worktree_mode = architect::config::DirtyWorktreeMode::Isolate;
    let (state, supervisor) = build_supervisor(dir.path(), config);

    let summary = supervisor
        .run("Ship with isolation", false)
        .await
        .expect("run succeeds despite dirt");
    assert!(summary.completed_tasks >= 5);

    // The isolated path was recorded and never committed.
    let context: RunContext = state.data(Namespace::Context).unwrap();
    let dirty = context.dirty_worktree.expect("dirty worktree recorded");
    assert_eq!(dirty.isolated_paths, vec!["scratch.txt".to_string()]);
    for patch in &context.session.patch_stack {
        assert!(!patch.files_changed.iter().any(|f| f == "scratch.txt"));
    }
    let metrics: Metrics = state.data(Namespace::Metrics).unwrap();
    assert!(!metrics.dirty_worktree_isolation.is_empty());
    // Still dirty afterwards: the file was isolated, not consumed.
    let status = git(dir.path(), &["status", "--porcelain"]);
    assert!(status.contains("scratch.txt"));
}

#[tokio::test]
async fn preflight_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let mut config = test_config();
    config.project.lint_command = "definitely-not-a-real-binary-xyz check".into();
    let (state, supervisor) = build_supervisor(dir.path(), config);

    let err = supervisor
        .run("Anything", false)
        .await
        .expect_err("preflight must fail");
    assert!(err.to_string().contains("Preflight failed"));

    let metrics: Metrics = state.data(Namespace::Metrics).unwrap();
    assert_eq!(metrics.preflight_history.len(), 1);
    assert!(!metrics.preflight_history[0].ok);
}
