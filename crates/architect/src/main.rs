//! `architect` CLI: init, run, status, patch review workflow, rollback.

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use architect::backends::{
    AgentBackend, ClaudeBackend, CodexBackend, ResilientBackend, RetryPolicy,
};
use architect::config::{load_config, save_config, ArchitectConfig};
use architect::contracts::{now_iso, now_stamp, Decision, DecisionsPayload, Metrics, RunStatus};
use architect::events::metrics_event_hook;
use architect::patch_stack::{Patch, PatchStack, PatchStatus};
use architect::specialists::SpecialistSet;
use architect::state_store::{Namespace, StateStore};
use architect::supervisor::Supervisor;
use architect::{contracts, paths};

#[derive(Parser)]
#[command(name = "architect", version, about = "Supervisor-driven coding specialist team")]
struct Cli {
    /// Path to the configuration file, relative to the repository root.
    #[arg(long, global = true, default_value = "architect.toml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and state in the current repository.
    Init {
        /// Primary backend to configure (claude or codex).
        #[arg(long)]
        backend: Option<String>,
    },
    /// Run the specialist team toward a goal.
    Run {
        goal: String,
        /// Resume the previous run's remaining tasks.
        #[arg(long)]
        resume: bool,
    },
    /// Show context, tasks, metrics, and patches.
    Status {
        #[arg(long)]
        verbose: bool,
    },
    /// Pause the workflow (future runs refuse until resumed).
    Pause,
    /// Clear the paused flag.
    Resume,
    /// List patches, or show one in detail.
    Review {
        #[arg(long)]
        patch: Option<String>,
    },
    /// Accept a patch after guardrail validation.
    Accept { patch_ref: String },
    /// Reject a patch with a revert commit.
    Reject { patch_ref: String },
    /// Queue a patch for modification in the next run.
    Modify { patch_ref: String },
    /// Roll back to a checkpoint on a new safety branch.
    Rollback { checkpoint_id: String },
    /// List checkpoints.
    Checkpoints,
    /// Switch the primary backend.
    Backend { name: String },
}

struct Runtime {
    config: ArchitectConfig,
    state: Arc<StateStore>,
    patches: Arc<PatchStack>,
    supervisor: Supervisor,
}

fn resolve_config_path(repo_root: &Path, config_value: &str) -> PathBuf {
    let path = PathBuf::from(config_value);
    if path.is_absolute() {
        path
    } else {
        repo_root.join(path)
    }
}

fn build_single_backend(name: &str, repo_root: &Path) -> Box<dyn AgentBackend> {
    if name == "codex" {
        Box::new(CodexBackend::new(Some(repo_root.to_path_buf())))
    } else {
        Box::new(ClaudeBackend::new(Some(repo_root.to_path_buf())))
    }
}

fn build_backend(
    config: &ArchitectConfig,
    repo_root: &Path,
    state: Arc<StateStore>,
) -> Arc<dyn AgentBackend> {
    let policy = RetryPolicy {
        max_retries: config.backend.max_retries,
        backoff_seconds: config.backend.retry_backoff_seconds.max(0.0),
        timeout_seconds: config.backend.timeout_seconds.max(5.0),
    };
    Arc::new(ResilientBackend::new(
        config.backend.primary.clone(),
        build_single_backend(&config.backend.primary, repo_root),
        config.backend.fallback.clone(),
        build_single_backend(&config.backend.fallback, repo_root),
        policy,
        Some(metrics_event_hook(state)),
    ))
}

fn load_runtime(repo_root: &Path, config_path: &Path) -> Result<Runtime> {
    let config = load_config(config_path)?;
    let state = Arc::new(
        StateStore::open(repo_root, config.state.backend, &config.state.branch_ref)
            .map_err(|err| anyhow!("{err}"))?,
    );
    let patches = Arc::new(
        PatchStack::new(repo_root, Some(state.clone())).map_err(|err| anyhow!("{err}"))?,
    );
    let backend = build_backend(&config, repo_root, state.clone());
    let specialists = SpecialistSet::build(backend, &config.agents, repo_root);
    let supervisor = Supervisor::new(
        state.clone(),
        patches.clone(),
        specialists,
        config.clone(),
        repo_root,
    );
    Ok(Runtime {
        config,
        state,
        patches,
        supervisor,
    })
}

fn add_user_decision(state: &StateStore, id: String, topic: &str, decision: String, rationale: &str) {
    let record = Decision {
        id,
        topic: topic.to_string(),
        decided_by: "user".into(),
        approved_by: "supervisor".into(),
        decision,
        rationale: rationale.to_string(),
        task_id: None,
        created_at: now_iso(),
        evidence: None,
    };
    let _ = state.update(Namespace::Decisions, move |mut payload: DecisionsPayload| {
        payload.decisions.push(record.clone());
        payload
    });
}

fn record_patch_metric(state: &StateStore, key: &str, commit_hash: &str) {
    let key = key.to_string();
    let commit_hash = commit_hash.to_string();
    let _ = state.update(Namespace::Metrics, move |mut metrics: Metrics| {
        let entry = metrics
            .extra
            .entry(key.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            if !items
                .iter()
                .any(|item| item.as_str() == Some(commit_hash.as_str()))
            {
                items.push(Value::String(commit_hash.clone()));
            }
        }
        metrics
    });
}

fn resolve_or_fail(patches: &PatchStack, patch_ref: &str) -> Result<Patch> {
    patches
        .resolve_patch(patch_ref, None)
        .map_err(|err| anyhow!("{err}"))?
        .ok_or_else(|| anyhow!("Patch not found: {patch_ref}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;
    let config_path = resolve_config_path(&repo_root, &cli.config);

    match cli.command {
        Commands::Init { backend } => {
            let mut config = load_config(&config_path)?;
            if let Some(backend) = backend {
                config.backend.primary = backend;
            }
            save_config(&config_path, &config)?;
            std::fs::create_dir_all(repo_root.join(".architect"))?;

            let state = StateStore::open(&repo_root, config.state.backend, &config.state.branch_ref)
                .map_err(|err| anyhow!("{err}"))?;
            let patches =
                PatchStack::new(&repo_root, None).map_err(|err| anyhow!("{err}"))?;
            let context: contracts::RunContext =
                state.data(Namespace::Context).map_err(|err| anyhow!("{err}"))?;
            if context.goal.is_empty() && context.current_run_id.is_none() {
                let initial = contracts::RunContext {
                    active_branch: patches.current_branch(),
                    status: RunStatus::Ready,
                    ..Default::default()
                };
                state
                    .set(Namespace::Context, &initial, None)
                    .map_err(|err| anyhow!("{err}"))?;
            }

            println!("Initialized Architect in {}", repo_root.display());
            println!("Config: {}", config_path.display());
            println!("Backend: {}", config.backend.primary);
            println!(
                "Git state enabled: {}",
                if state.git_enabled() {
                    "yes"
                } else {
                    "no (using local .architect/state)"
                }
            );
        }

        Commands::Run { goal, resume } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            info!(
                primary = %runtime.config.backend.primary,
                fallback = %runtime.config.backend.fallback,
                state = %runtime.state.mode(),
                "architect starting"
            );
            let summary = runtime.supervisor.run(&goal, resume).await?;
            println!("Goal complete: {}", summary.goal);
            println!("Run ID: {}", summary.run_id);
            println!(
                "Tasks: {}/{}",
                summary.completed_tasks, summary.total_tasks
            );
            if let Some(checkpoint) = summary.checkpoint_id {
                println!("Checkpoint: {checkpoint}");
            }
        }

        Commands::Status { verbose } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let payload = runtime.supervisor.status(verbose)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }

        Commands::Pause => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            runtime.supervisor.pause()?;
            println!("Workflow paused.");
        }

        Commands::Resume => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            runtime.supervisor.resume_workflow()?;
            println!("Workflow resumed.");
        }

        Commands::Review { patch } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let patches = runtime
                .patches
                .list_patches(None, None)
                .map_err(|err| anyhow!("{err}"))?;
            if patches.is_empty() {
                println!("No patches available.");
                return Ok(());
            }
            if let Some(patch_ref) = patch {
                let patch = resolve_or_fail(&runtime.patches, &patch_ref)?;
                let summary = runtime
                    .patches
                    .describe_patch(&patch.patch_id)
                    .map_err(|err| anyhow!("{err}"))?;
                let payload = serde_json::json!({
                    "patch": patch,
                    "summary": summary,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
                return Ok(());
            }
            for patch in patches {
                println!(
                    "{} {} {:<9} {}",
                    patch.patch_id,
                    &patch.commit_hash[..patch.commit_hash.len().min(10)],
                    patch.status.to_string(),
                    patch.subject
                );
            }
        }

        Commands::Accept { patch_ref } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let patch = resolve_or_fail(&runtime.patches, &patch_ref)?;
            for file in &patch.files_changed {
                if paths::is_internal_path(file) {
                    continue;
                }
                if let Some(pattern) =
                    paths::match_any(file, &runtime.config.guardrails.forbidden_paths)
                {
                    bail!(
                        "Patch touches forbidden path '{file}' (matched guardrail '{pattern}')."
                    );
                }
            }
            runtime
                .patches
                .update_patch_status(&patch.commit_hash, PatchStatus::Accepted, None)
                .map_err(|err| anyhow!("{err}"))?;
            record_patch_metric(&runtime.state, "accepted_patches", &patch.commit_hash);
            add_user_decision(
                &runtime.state,
                format!("dec-accept-{}", &patch.commit_hash[..patch.commit_hash.len().min(8)]),
                "patch_lifecycle",
                format!("Accepted patch {}", patch.patch_id),
                "Patch passed review and guardrail validation.",
            );
            println!(
                "Accepted {} ({})",
                patch.patch_id,
                &patch.commit_hash[..patch.commit_hash.len().min(10)]
            );
        }

        Commands::Reject { patch_ref } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let patch = runtime
                .patches
                .reject_patch(&patch_ref)
                .map_err(|err| anyhow!("{err}"))?;
            record_patch_metric(&runtime.state, "rejected_patches", &patch.commit_hash);
            add_user_decision(
                &runtime.state,
                format!("dec-reject-{}", &patch.commit_hash[..patch.commit_hash.len().min(8)]),
                "patch_lifecycle",
                format!("Rejected patch {}", patch.patch_id),
                "Patch reverted via reject workflow.",
            );
            println!(
                "Rejected {} ({})",
                patch.patch_id,
                &patch.commit_hash[..patch.commit_hash.len().min(10)]
            );
        }

        Commands::Modify { patch_ref } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let patch = resolve_or_fail(&runtime.patches, &patch_ref)?;

            let mut branch_name = None;
            if runtime.patches.git_enabled() {
                let branch = format!("architect/amend-{}-{}", patch.patch_id, now_stamp());
                runtime
                    .patches
                    .create_branch(&branch, &patch.commit_hash)
                    .map_err(|err| anyhow!("{err}"))?;
                branch_name = Some(branch);
            }

            let task = contracts::WorkTask::new(
                format!("task-modify-{}", &patch.commit_hash[..patch.commit_hash.len().min(8)]),
                contracts::TaskType::Implement,
                format!(
                    "Amend patch {} ({}).",
                    patch.patch_id,
                    &patch.commit_hash[..patch.commit_hash.len().min(10)]
                ),
            );
            runtime
                .state
                .update(Namespace::Tasks, move |mut payload: contracts::TasksPayload| {
                    payload.task_queue.push(task.clone());
                    payload
                })
                .map_err(|err| anyhow!("{err}"))?;

            runtime
                .patches
                .update_patch_status(&patch.commit_hash, PatchStatus::Modified, None)
                .map_err(|err| anyhow!("{err}"))?;
            add_user_decision(
                &runtime.state,
                format!("dec-modify-{}", &patch.commit_hash[..patch.commit_hash.len().min(8)]),
                "patch_modification",
                format!("Modify patch {}", patch.patch_id),
                "Manual patch modification requested.",
            );

            let branch_for_context = branch_name.clone();
            runtime
                .state
                .update(Namespace::Context, move |mut ctx: contracts::RunContext| {
                    ctx.phase = contracts::Phase::Implementation;
                    ctx.status = RunStatus::InProgress;
                    if let Some(branch) = &branch_for_context {
                        ctx.active_branch = branch.clone();
                    }
                    ctx
                })
                .map_err(|err| anyhow!("{err}"))?;

            let mut message = format!("Marked {} for modification.", patch.patch_id);
            if let Some(branch) = branch_name {
                message.push_str(&format!(" Amendment branch: {branch}"));
            }
            println!("{message}");
        }

        Commands::Rollback { checkpoint_id } => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let branch = runtime
                .patches
                .rollback(&checkpoint_id)
                .map_err(|err| anyhow!("{err}"))?;
            println!("Rolled back to {checkpoint_id} on {branch}");
        }

        Commands::Checkpoints => {
            let runtime = load_runtime(&repo_root, &config_path)?;
            let checkpoints = runtime.patches.list_checkpoints();
            if checkpoints.is_empty() {
                println!("No checkpoints found.");
                return Ok(());
            }
            for checkpoint in checkpoints {
                println!("{checkpoint}");
            }
        }

        Commands::Backend { name } => {
            if name != "claude" && name != "codex" {
                bail!("Unknown backend '{name}' (expected claude or codex).");
            }
            let mut config = load_config(&config_path)?;
            config.backend.primary = name.clone();
            save_config(&config_path, &config)?;
            println!("Primary backend set to {name}");
        }
    }

    Ok(())
}
