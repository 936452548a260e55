//! The scheduler: run lifecycle, task graph, gate loop, leases, checkpoints.
//!
//! One `run()` drives a goal through plan → implement → test → review →
//! document. Ready tasks of the same type run concurrently up to
//! `max_parallel_tasks`, except worktree-mutating types which are strictly
//! serial so patch staging stays unambiguous. Every state transition is
//! persisted through the state store, so a failed or interrupted run can be
//! resumed, audited, or rolled back.

pub mod command;
pub mod gates;
pub mod graph;
pub mod lease;
pub mod parsing;
pub mod preflight;

use anyhow::{anyhow, bail, Context as _, Result};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backends::BackendContext;
use crate::config::{ArchitectConfig, BranchStrategy, DirtyWorktreeMode};
use crate::contracts::{
    keep_last, now_iso, now_stamp, truncate_chars, Checkpoint, CheckpointsPayload, Decision,
    DecisionsPayload, DirtyIsolationRecord, DirtyWorktreeState, GateResult, Metrics, PhaseEvent,
    PreflightReport, RunContext, RunRecord, RunStatus, RunSummary, RunsPayload, Session,
    TaskStatus, TaskType, TasksPayload, WorkTask, DIRTY_ISOLATION_LIMIT, PREFLIGHT_HISTORY_LIMIT,
};
use crate::patch_stack::{Patch, PatchRecord, PatchStack, WorktreePatchRequest};
use crate::specialists::{Specialist, SpecialistResponse, SpecialistSet};
use crate::state_store::{Namespace, StateError, StateResult, StateStore};

/// Outcome of one task's attempt loop, applied back onto the shared graph by
/// the scheduler.
struct TaskOutcome {
    index: usize,
    task: WorkTask,
    gate: GateResult,
    content: String,
    new_patch_files: Vec<String>,
}

pub struct Supervisor {
    state: Arc<StateStore>,
    patches: Arc<PatchStack>,
    specialists: HashMap<String, Specialist>,
    supervisor_agent: Option<Specialist>,
    config: ArchitectConfig,
    repo_root: PathBuf,
}

impl Supervisor {
    pub fn new(
        state: Arc<StateStore>,
        patches: Arc<PatchStack>,
        specialists: SpecialistSet,
        config: ArchitectConfig,
        repo_root: &Path,
    ) -> Self {
        Self {
            state,
            patches,
            specialists: specialists.specialists,
            supervisor_agent: specialists.supervisor,
            config,
            repo_root: repo_root.to_path_buf(),
        }
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    pub async fn run(&self, goal: &str, resume: bool) -> Result<RunSummary> {
        let now = now_iso();
        let context: RunContext = self.state.data(Namespace::Context)?;
        if context.paused && !resume {
            bail!("Workflow is paused. Run `architect resume` first.");
        }

        // Worktree discipline: refuse or isolate pre-existing dirt.
        let isolated_paths = if resume {
            context
                .dirty_worktree
                .as_ref()
                .map(|d| d.isolated_paths.clone())
                .unwrap_or_default()
        } else {
            self.check_worktree_discipline()?
        };

        // Preflight probes; a missing required executable is fatal.
        let preflight = preflight::run_preflight(&self.config);
        for warning in &preflight.warnings {
            warn!(warning = %warning, "preflight warning");
        }
        self.record_preflight(&preflight)?;
        if !preflight.ok {
            bail!("Preflight failed: {}", preflight.errors.join("; "));
        }

        // Modify tasks queued by the user survive into the fresh graph.
        let modify_tasks = graph::load_pending_modify_tasks(&self.state);

        // Resumption: demote in_progress back to pending and pick up where
        // the previous run stopped.
        let existing: TasksPayload = self.state.data(Namespace::Tasks)?;
        let mut existing_tasks = existing.task_queue;
        for task in &mut existing_tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.started_at = None;
            }
        }
        let resumable = existing_tasks
            .iter()
            .any(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::Failed));

        let resumed_run_id = if resume && resumable {
            context.current_run_id.clone()
        } else {
            None
        };
        let (run_id, started_at, base_branch, run_branch, mut tasks) =
            if let Some(run_id) = resumed_run_id {
                let started_at = context.started_at.clone().unwrap_or_else(|| now.clone());
                let base_branch = if context.session.base_branch.is_empty() {
                    self.patches.current_branch()
                } else {
                    context.session.base_branch.clone()
                };
                let run_branch = self.patches.current_branch();
                for task in &mut existing_tasks {
                    if task.status == TaskStatus::Failed {
                        task.status = TaskStatus::Pending;
                        task.failure_reason = None;
                        task.completed_at = None;
                    }
                }
                info!(run_id = %run_id, tasks = existing_tasks.len(), "resuming existing run");
                (run_id, started_at, base_branch, run_branch, existing_tasks)
            } else {
                let run_id = format!(
                    "run-{}-{}",
                    now_stamp(),
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                );
                let base_branch = self.patches.current_branch();
                let run_branch = if self.patches.git_enabled()
                    && self.config.workflow.branch_strategy == BranchStrategy::AuxiliaryBranches
                {
                    let branch = format!("architect/{run_id}");
                    self.patches
                        .create_branch(&branch, &base_branch)
                        .context("failed to create run branch")?;
                    branch
                } else {
                    base_branch.clone()
                };
                info!(run_id = %run_id, branch = %run_branch, "starting fresh run");
                (
                    run_id,
                    now.clone(),
                    base_branch,
                    run_branch,
                    vec![graph::plan_task(goal)],
                )
            };

        if !isolated_paths.is_empty() {
            self.record_dirty_isolation(&run_id, &isolated_paths)?;
        }

        let fresh_context = RunContext {
            goal: goal.to_string(),
            phase: crate::contracts::Phase::Planning,
            status: RunStatus::InProgress,
            active_branch: run_branch.clone(),
            paused: false,
            current_run_id: Some(run_id.clone()),
            started_at: Some(started_at.clone()),
            ended_at: None,
            session: Session {
                run_id: Some(run_id.clone()),
                goal: goal.to_string(),
                base_branch,
                active_branch: run_branch.clone(),
                started_at: Some(started_at.clone()),
                ended_at: None,
                checkpoint_id: None,
                phase_history: vec![PhaseEvent {
                    phase: "planning".into(),
                    status: "started".into(),
                    at: now.clone(),
                }],
                patch_stack: Vec::new(),
            },
            preflight: Some(preflight),
            dirty_worktree: if isolated_paths.is_empty() {
                None
            } else {
                Some(DirtyWorktreeState {
                    mode: "isolate".into(),
                    isolated_paths: isolated_paths.clone(),
                })
            },
            extra: Default::default(),
        };
        self.state.set(Namespace::Context, &fresh_context, None)?;
        self.persist_tasks(&tasks)?;

        // Single-writer lease for the whole run.
        lease::acquire_lease(
            &self.state,
            &run_id,
            self.config.backend.timeout_seconds,
            resume,
        )
        .map_err(|err| anyhow!("{err}"))?;
        self.record_run_record(&run_id, goal, RunStatus::InProgress, &started_at, 0, None)?;

        let supervisor_steps = self.run_supervisor_decomposition(goal).await;

        // ------------------------------------------------------------------
        // Ready-set loop
        // ------------------------------------------------------------------
        let mut run_patch_files: Vec<String> = Vec::new();
        let mut completed_tasks = 0usize;
        let conflict_cycles = AtomicU32::new(0);
        let max_parallel = self.config.workflow.max_parallel_tasks.max(1);
        let mut peak_parallelism = 0usize;

        loop {
            let ready = graph::ready_tasks(&tasks);
            let Some(&first) = ready.first() else {
                break;
            };
            let batch_type = tasks[first].task_type;
            let batch: Vec<usize> = if batch_type.mutates_worktree() {
                vec![first]
            } else {
                ready
                    .into_iter()
                    .filter(|&index| tasks[index].task_type == batch_type)
                    .take(max_parallel)
                    .collect()
            };

            if batch.len() > peak_parallelism {
                peak_parallelism = batch.len();
                let peak = batch.len() as u64;
                self.bump_metrics(move |metrics| {
                    metrics.scheduler_parallelism = metrics.scheduler_parallelism.max(peak);
                })?;
            }

            for &index in &batch {
                self.set_task_status(&mut tasks, index, TaskStatus::InProgress, None)?;
            }
            self.state.update(Namespace::Context, |mut ctx: RunContext| {
                ctx.phase = batch_type.phase();
                ctx.push_phase(batch_type, "started");
                ctx
            })?;

            let futures: Vec<_> = batch
                .iter()
                .map(|&index| {
                    self.execute_task(
                        index,
                        tasks[index].clone(),
                        goal,
                        &run_id,
                        run_patch_files.clone(),
                        &isolated_paths,
                        &conflict_cycles,
                    )
                })
                .collect();
            let outcomes = join_all(futures).await;

            for outcome in outcomes {
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.finalize_failure(&run_id, goal, None, &err.to_string())?;
                        return Err(err);
                    }
                };
                let TaskOutcome {
                    index,
                    task,
                    gate,
                    content,
                    new_patch_files,
                } = outcome;
                tasks[index] = task;
                run_patch_files.extend(new_patch_files);

                if !gate.passed {
                    self.set_task_status(
                        &mut tasks,
                        index,
                        TaskStatus::Failed,
                        Some(gate.reason.clone()),
                    )?;
                    self.finalize_failure(
                        &run_id,
                        goal,
                        Some(&tasks[index]),
                        &gate.reason,
                    )?;
                    bail!(
                        "Quality gate failed: {} ({}) - {}",
                        gate.name,
                        tasks[index].id,
                        gate.reason
                    );
                }

                self.record_task_decision(&tasks[index], &content)?;
                self.set_task_status(&mut tasks, index, TaskStatus::Completed, None)?;
                completed_tasks += 1;
                let task_type = tasks[index].task_type;
                self.state.update(Namespace::Context, move |mut ctx: RunContext| {
                    ctx.push_phase(task_type, "completed");
                    ctx.phase = task_type.next_phase();
                    ctx
                })?;

                // The initial plan task expands the single-entry graph.
                if task_type == TaskType::Plan && tasks.len() == 1 {
                    let mut steps = parsing::extract_plan_steps(&content);
                    if steps.is_empty() {
                        steps = supervisor_steps.clone();
                    }
                    let plan_done = tasks[0].clone();
                    tasks = graph::create_task_graph(
                        goal,
                        &steps,
                        modify_tasks.clone(),
                        self.config.workflow.max_patches_before_review,
                        self.config.workflow.require_critic_approval,
                    );
                    tasks[0] = plan_done;
                    self.persist_tasks(&tasks)?;
                    info!(tasks = tasks.len(), "task graph expanded from plan");
                }
            }
        }

        if tasks
            .iter()
            .any(|task| task.status != TaskStatus::Completed)
        {
            let pending: Vec<&str> = tasks
                .iter()
                .filter(|task| task.status != TaskStatus::Completed)
                .map(|task| task.id.as_str())
                .collect();
            let reason = format!("Task graph did not complete. Pending tasks: {pending:?}");
            self.finalize_failure(&run_id, goal, None, &reason)?;
            bail!(reason);
        }

        // ------------------------------------------------------------------
        // Terminal checkpoint and bookkeeping
        // ------------------------------------------------------------------
        let checkpoint_id = self
            .patches
            .create_checkpoint(&format!("{run_id}-complete"))
            .map_err(|err| anyhow!("failed to create final checkpoint: {err}"))?;
        self.add_checkpoint(Checkpoint {
            id: checkpoint_id.clone(),
            created_at: now_iso(),
            goal: goal.to_string(),
            run_id: run_id.clone(),
            active_branch: self.patches.current_branch(),
            failure_task_id: None,
            failure_reason: None,
        })?;

        {
            let run_id = run_id.clone();
            let checkpoint_id = checkpoint_id.clone();
            let completed = completed_tasks as u64;
            self.bump_metrics(move |metrics| {
                for item in &mut metrics.patch_stack {
                    if item.run_id.as_deref() == Some(run_id.as_str()) {
                        item.checkpoint_id = Some(checkpoint_id.clone());
                    }
                }
                metrics.last_run_completed_tasks = completed;
                metrics.last_run_id = Some(run_id.clone());
            })?;
        }

        let ended_at = now_iso();
        self.record_run_record(
            &run_id,
            goal,
            RunStatus::Complete,
            &started_at,
            completed_tasks as u32,
            None,
        )?;
        {
            let ended = ended_at.clone();
            let checkpoint = checkpoint_id.clone();
            let branch = self.patches.current_branch();
            self.state.update(Namespace::Context, move |mut ctx: RunContext| {
                ctx.phase = crate::contracts::Phase::Complete;
                ctx.status = RunStatus::Complete;
                ctx.active_branch = branch.clone();
                ctx.ended_at = Some(ended.clone());
                ctx.paused = false;
                ctx.session.ended_at = Some(ended.clone());
                ctx.session.checkpoint_id = Some(checkpoint.clone());
                ctx.push_phase("complete", "completed");
                ctx
            })?;
        }
        lease::release_lease(&self.state, &run_id).map_err(|err| anyhow!("{err}"))?;

        info!(
            run_id = %run_id,
            completed = completed_tasks,
            checkpoint = %checkpoint_id,
            "run complete"
        );
        Ok(RunSummary {
            goal: goal.to_string(),
            run_id,
            started_at,
            ended_at,
            total_tasks: tasks.len(),
            completed_tasks,
            checkpoint_id: Some(checkpoint_id),
        })
    }

    // ------------------------------------------------------------------
    // Per-task execution
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn execute_task(
        &self,
        index: usize,
        mut task: WorkTask,
        goal: &str,
        run_id: &str,
        mut known_patch_files: Vec<String>,
        isolated_paths: &[String],
        conflict_cycles: &AtomicU32,
    ) -> Result<TaskOutcome> {
        let max_attempts = self.config.workflow.task_max_attempts.max(1);
        let mut last_gate: Option<GateResult> = None;
        let mut last_content = String::new();
        let mut new_patch_files: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            task.attempt = attempt;
            if let Err(err) = lease::heartbeat_lease(
                &self.state,
                run_id,
                Some(&task.id),
                self.config.backend.timeout_seconds,
            ) {
                warn!(task = %task.id, error = %err, "lease heartbeat failed");
            }

            let response = self.run_specialist(&task, goal).await?;
            last_content = response.content.clone();
            task.output_summary = truncate_chars(&response.content, 4000);
            self.write_task_artifact(run_id, &task, &response.content)?;

            let mut current_patch: Option<Patch> = None;
            if task.task_type.mutates_worktree() && self.patches.git_enabled() {
                match self.create_patch_for_task(&task, run_id, &response.content, isolated_paths)
                {
                    Ok(patch) => {
                        task.patch_id = Some(patch.patch_id.clone());
                        new_patch_files.extend(patch.files_changed.clone());
                        known_patch_files.extend(patch.files_changed.clone());
                        self.append_session_patch(&patch, &task, run_id)?;
                        current_patch = Some(patch);
                    }
                    Err(StateError::Guardrail(message)) => {
                        // The commit was blocked and the worktree restored;
                        // surface as a failed gate so retry/replan applies.
                        let gate = GateResult {
                            name: task.task_type.gate_name().to_string(),
                            task_id: task.id.clone(),
                            passed: false,
                            reason: format!("Guardrail violation before commit: {message}"),
                            artifacts: vec![json!({
                                "type": "guardrail",
                                "name": "pre_commit",
                                "detail": message,
                            })],
                            checked_at: now_iso(),
                        };
                        self.record_gate_result(&gate)?;
                        if attempt < max_attempts {
                            let remediation = self
                                .handle_gate_failure(
                                    &task,
                                    &gate,
                                    goal,
                                    run_id,
                                    &last_content,
                                    isolated_paths,
                                    conflict_cycles,
                                    attempt,
                                )
                                .await?;
                            new_patch_files.extend(remediation.clone());
                            known_patch_files.extend(remediation);
                        }
                        last_gate = Some(gate);
                        continue;
                    }
                    Err(err) => return Err(anyhow!("patch creation failed: {err}")),
                }
            }

            let gate = self
                .evaluate_gate(&task, &response.content, &known_patch_files, current_patch.as_ref())
                .await;
            self.record_gate_result(&gate)?;
            if gate.passed {
                last_gate = Some(gate);
                break;
            }
            if attempt < max_attempts {
                let remediation = self
                    .handle_gate_failure(
                        &task,
                        &gate,
                        goal,
                        run_id,
                        &last_content,
                        isolated_paths,
                        conflict_cycles,
                        attempt,
                    )
                    .await?;
                new_patch_files.extend(remediation.clone());
                known_patch_files.extend(remediation);
            }
            last_gate = Some(gate);
        }

        let gate = last_gate
            .ok_or_else(|| anyhow!("Task execution failed unexpectedly for {}", task.id))?;
        Ok(TaskOutcome {
            index,
            task,
            gate,
            content: last_content,
            new_patch_files,
        })
    }

    /// Replan, optionally run a conflict-resolution cycle (failed review
    /// gates only), then sleep the retry backoff. Returns files changed by
    /// remediation, if any.
    #[allow(clippy::too_many_arguments)]
    async fn handle_gate_failure(
        &self,
        task: &WorkTask,
        gate: &GateResult,
        goal: &str,
        run_id: &str,
        content: &str,
        isolated_paths: &[String],
        conflict_cycles: &AtomicU32,
        attempt: u32,
    ) -> Result<Vec<String>> {
        self.bump_metrics(|metrics| metrics.task_retry_count += 1)?;
        self.run_replan(task, &gate.reason, goal).await;

        let mut remediation_files = Vec::new();
        if task.task_type == TaskType::Review && !content.trim().is_empty() {
            let budget = self.config.workflow.max_conflict_cycles;
            let mut current = conflict_cycles.load(Ordering::SeqCst);
            let mut claimed = false;
            while current < budget {
                match conflict_cycles.compare_exchange(
                    current,
                    current + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        claimed = true;
                        break;
                    }
                    Err(observed) => current = observed,
                }
            }
            if claimed {
                self.bump_metrics(|metrics| metrics.conflict_resolution_cycles += 1)?;
                match self
                    .run_conflict_resolution(task, content, goal, run_id, isolated_paths)
                    .await
                {
                    Ok(Some(patch)) => remediation_files = patch.files_changed,
                    Ok(None) => {}
                    Err(err) => warn!(task = %task.id, error = %err, "conflict resolution failed"),
                }
            } else {
                warn!(
                    task = %task.id,
                    budget,
                    "conflict-resolution budget exhausted; retrying without remediation"
                );
            }
        }

        let delay = self.config.workflow.task_retry_backoff_seconds
            * f64::from(1u32 << (attempt - 1).min(16));
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        Ok(remediation_files)
    }

    // ------------------------------------------------------------------
    // Specialist dispatch
    // ------------------------------------------------------------------

    async fn run_specialist(&self, task: &WorkTask, goal: &str) -> Result<SpecialistResponse> {
        let specialist = self.specialists.get(&task.assigned_to).ok_or_else(|| {
            anyhow!("No specialist registered for role '{}'.", task.assigned_to)
        })?;
        let mut context = BackendContext::new();
        context.insert("goal".into(), json!(goal));
        context.insert("task".into(), serde_json::to_value(task)?);
        context.insert(
            "_working_directory".into(),
            json!(self.repo_root.to_string_lossy()),
        );
        let allowed: Option<Vec<String>> = task.allowed_tools.clone().or_else(|| {
            task.task_type
                .default_tools()
                .map(|tools| tools.iter().map(|tool| tool.to_string()).collect())
        });
        specialist
            .run(&task.description, context, allowed.as_deref())
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    /// Optional supervisor decomposition: a hint list of steps used only when
    /// the planner's own output yields none. Degrades gracefully.
    async fn run_supervisor_decomposition(&self, goal: &str) -> Vec<String> {
        let Some(agent) = &self.supervisor_agent else {
            return Vec::new();
        };
        let mut context = BackendContext::new();
        context.insert("goal".into(), json!(goal));
        context.insert("phase".into(), json!("decomposition"));
        let instruction = "Decompose this goal into implementation milestones and ordering \
                           constraints. Return concise numbered or bullet steps.";
        match agent.run(instruction, context, None).await {
            Ok(response) => {
                let steps = parsing::extract_plan_steps(&response.content);
                let decision = Decision {
                    id: format!(
                        "dec-supervisor-{}",
                        &uuid::Uuid::new_v4().simple().to_string()[..8]
                    ),
                    topic: "goal_decomposition".into(),
                    decided_by: "supervisor".into(),
                    approved_by: "supervisor".into(),
                    decision: truncate_chars(&response.content, 4000),
                    rationale: "Supervisor decomposition before planner task.".into(),
                    task_id: None,
                    created_at: now_iso(),
                    evidence: None,
                };
                if let Err(err) = self.add_decision(decision) {
                    warn!(error = %err, "failed to record supervisor decomposition");
                }
                steps
            }
            Err(err) => {
                warn!(error = %err, "supervisor decomposition unavailable");
                Vec::new()
            }
        }
    }

    async fn run_replan(&self, failed_task: &WorkTask, reason: &str, goal: &str) {
        let Some(planner) = self.specialists.get("planner") else {
            return;
        };
        let mut context = BackendContext::new();
        context.insert("goal".into(), json!(goal));
        context.insert(
            "failed_task".into(),
            serde_json::to_value(failed_task).unwrap_or(Value::Null),
        );
        context.insert("reason".into(), json!(reason));
        let instruction = format!(
            "Re-plan after a failed quality gate. Task={}. Reason={reason}. \
             Provide concise corrective steps.",
            failed_task.id
        );
        match planner.run(&instruction, context, None).await {
            Ok(response) => {
                let decision = Decision {
                    id: format!(
                        "dec-replan-{}-{}",
                        failed_task.id,
                        &uuid::Uuid::new_v4().simple().to_string()[..8]
                    ),
                    topic: "replan".into(),
                    decided_by: "planner".into(),
                    approved_by: "supervisor".into(),
                    decision: truncate_chars(&response.content, 4000),
                    rationale: format!("Automatic replanning after failure in {}", failed_task.id),
                    task_id: Some(failed_task.id.clone()),
                    created_at: now_iso(),
                    evidence: None,
                };
                if let Err(err) = self.add_decision(decision) {
                    warn!(error = %err, "failed to record replan decision");
                }
                if let Err(err) = self.bump_metrics(|metrics| metrics.replan_count += 1) {
                    warn!(error = %err, "failed to bump replan counter");
                }
            }
            Err(err) => warn!(task = %failed_task.id, error = %err, "replan call failed"),
        }
    }

    /// Conflict-resolution cycle for failed review gates: critic → planner →
    /// supervisor agent (each optional), then the coder applies remediation
    /// with an implementation tool set.
    async fn run_conflict_resolution(
        &self,
        review_task: &WorkTask,
        critic_output: &str,
        goal: &str,
        run_id: &str,
        isolated_paths: &[String],
    ) -> Result<Option<Patch>> {
        let mut transcript: Vec<String> = Vec::new();
        let advisors = [
            ("critic", "Summarize the blocking findings and what must change."),
            ("planner", "Propose the minimal corrective steps for the blockers."),
        ];
        for (role, brief) in advisors {
            let Some(agent) = self.specialists.get(role) else {
                continue;
            };
            let mut context = BackendContext::new();
            context.insert("goal".into(), json!(goal));
            context.insert("conflict_resolution".into(), json!(true));
            let instruction = format!(
                "{brief}\n\nReview output:\n{}",
                truncate_chars(critic_output, 4000)
            );
            match agent.run(&instruction, context, None).await {
                Ok(response) => {
                    self.add_conflict_decision(role, review_task, &response.content)?;
                    transcript.push(format!("[{role}] {}", response.content));
                }
                Err(err) => warn!(role, error = %err, "conflict advisor unavailable"),
            }
        }
        if let Some(agent) = &self.supervisor_agent {
            let mut context = BackendContext::new();
            context.insert("goal".into(), json!(goal));
            context.insert("conflict_resolution".into(), json!(true));
            let instruction = format!(
                "Arbitrate the disagreement and pick one remediation path.\n\n{}",
                truncate_chars(&transcript.join("\n\n"), 4000)
            );
            match agent.run(&instruction, context, None).await {
                Ok(response) => {
                    self.add_conflict_decision("supervisor", review_task, &response.content)?;
                    transcript.push(format!("[supervisor] {}", response.content));
                }
                Err(err) => warn!(error = %err, "supervisor arbitration unavailable"),
            }
        }

        let Some(coder) = self.specialists.get("coder") else {
            return Ok(None);
        };
        let mut context = BackendContext::new();
        context.insert("goal".into(), json!(goal));
        context.insert(
            "review_task".into(),
            serde_json::to_value(review_task).unwrap_or(Value::Null),
        );
        context.insert("remediation".into(), json!(true));
        let tools: Vec<String> = TaskType::Implement
            .default_tools()
            .unwrap_or_default()
            .iter()
            .map(|tool| tool.to_string())
            .collect();
        let instruction = format!(
            "Resolve critic blockers from review output and apply required repository changes. \
             Return concise remediation actions and what was fixed.\n\nCritic output:\n{}\n\n\
             Team decisions:\n{}",
            truncate_chars(critic_output, 4000),
            truncate_chars(&transcript.join("\n\n"), 4000)
        );
        let response = coder
            .run(&instruction, context, Some(&tools))
            .await
            .map_err(|err| anyhow!("{err}"))?;
        self.add_conflict_decision("coder", review_task, &response.content)?;

        if !self.patches.git_enabled() {
            return Ok(None);
        }
        let dirty = self
            .patches
            .worktree_status()
            .map_err(|err| anyhow!("{err}"))?;
        let has_changes = dirty.iter().any(|path| {
            !crate::paths::is_internal_path(path) && !isolated_paths.contains(path)
        });
        if !has_changes {
            return Ok(None);
        }

        let subject = format!("architect: remediation-{}", review_task.id);
        let body = format!(
            "Run: {run_id}\nTask: {}\n\n{}",
            review_task.id,
            truncate_chars(&response.content, 2000)
        );
        let task_id = format!("{}-remediation", review_task.id);
        let request = WorktreePatchRequest {
            subject: &subject,
            body: &body,
            task_id: &task_id,
            run_id,
            fallback_file: None,
            fallback_content: None,
            fallback_mode: self.config.workflow.fallback_artifact_mode,
            max_files: self.config.guardrails.max_file_changes_per_patch,
            forbidden_paths: &self.config.guardrails.forbidden_paths,
            exclude_paths: isolated_paths,
        };
        match self.patches.create_task_patch_from_worktree(&request) {
            Ok(patch) => {
                self.append_session_patch(&patch, review_task, run_id)?;
                Ok(Some(patch))
            }
            Err(StateError::Guardrail(message)) => {
                warn!(task = %review_task.id, %message, "remediation blocked by guardrail");
                Ok(None)
            }
            Err(err) => Err(anyhow!("{err}")),
        }
    }

    // ------------------------------------------------------------------
    // Worktree, artifacts, patches
    // ------------------------------------------------------------------

    /// Read VCS status minus the tool's own artifacts. Refuse or isolate per
    /// configuration; returns the isolated path list.
    fn check_worktree_discipline(&self) -> Result<Vec<String>> {
        if !self.patches.git_enabled() {
            return Ok(Vec::new());
        }
        let dirty: Vec<String> = self
            .patches
            .worktree_status()
            .map_err(|err| anyhow!("{err}"))?
            .into_iter()
            .filter(|path| !crate::paths::is_internal_path(path))
            .collect();
        if dirty.is_empty() {
            return Ok(Vec::new());
        }
        match self.config.workflow.dirty_worktree_mode {
            DirtyWorktreeMode::Refuse => {
                let listing = dirty
                    .iter()
                    .take(20)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                bail!(
                    "Refusing to run with dirty worktree. Commit/stash changes first.\nDetected:\n{listing}"
                );
            }
            DirtyWorktreeMode::Isolate => {
                info!(paths = dirty.len(), "isolating dirty worktree paths");
                Ok(dirty)
            }
        }
    }

    fn write_task_artifact(&self, run_id: &str, task: &WorkTask, content: &str) -> Result<PathBuf> {
        let run_dir = self.repo_root.join(".architect").join("runs").join(run_id);
        std::fs::create_dir_all(&run_dir)?;
        let artifact_path = run_dir.join(format!("{}.md", task.id));
        let body = format!(
            "# Task {}\n\nType: {}\nAssigned: {}\nGenerated At: {}\n\n## Output\n{}\n",
            task.id,
            task.task_type,
            task.assigned_to,
            now_iso(),
            content.trim()
        );
        std::fs::write(&artifact_path, body)?;
        Ok(artifact_path)
    }

    fn tracked_fallback_path(&self, run_id: &str, task: &WorkTask) -> PathBuf {
        self.repo_root
            .join(&self.config.workflow.tracked_fallback_dir)
            .join(run_id)
            .join(format!("{}.md", task.id))
    }

    fn tracked_fallback_content(&self, run_id: &str, task: &WorkTask, content: &str) -> String {
        format!(
            "# {}\n\nRun: {run_id}\nType: {}\nGenerated At: {}\n\n## Fallback output\n{}\n",
            task.id,
            task.task_type,
            now_iso(),
            content.trim()
        )
    }

    fn create_patch_for_task(
        &self,
        task: &WorkTask,
        run_id: &str,
        content: &str,
        isolated_paths: &[String],
    ) -> StateResult<Patch> {
        let subject = format!("architect: {}", task.id);
        let body = format!(
            "Run: {run_id}\nTask: {}\n\n{}",
            task.id,
            truncate_chars(content, 2000)
        );
        let fallback_file = self.tracked_fallback_path(run_id, task);
        let fallback_content = self.tracked_fallback_content(run_id, task, content);
        let request = WorktreePatchRequest {
            subject: &subject,
            body: &body,
            task_id: &task.id,
            run_id,
            fallback_file: Some(&fallback_file),
            fallback_content: Some(&fallback_content),
            fallback_mode: self.config.workflow.fallback_artifact_mode,
            max_files: self.config.guardrails.max_file_changes_per_patch,
            forbidden_paths: &self.config.guardrails.forbidden_paths,
            exclude_paths: isolated_paths,
        };
        self.patches.create_task_patch_from_worktree(&request)
    }

    fn append_session_patch(&self, patch: &Patch, task: &WorkTask, run_id: &str) -> Result<()> {
        let record = PatchRecord {
            patch_id: patch.patch_id.clone(),
            commit_hash: patch.commit_hash.clone(),
            subject: patch.subject.clone(),
            status: patch.status,
            task_id: patch.task_id.clone().or_else(|| Some(task.id.clone())),
            run_id: Some(run_id.to_string()),
            created_at: now_iso(),
            updated_at: None,
            files_changed: patch.files_changed.clone(),
            checkpoint_id: None,
            status_note: None,
        };
        self.state.update(Namespace::Context, move |mut ctx: RunContext| {
            ctx.session.patch_stack.push(record.clone());
            ctx
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State bookkeeping
    // ------------------------------------------------------------------

    fn persist_tasks(&self, tasks: &[WorkTask]) -> StateResult<()> {
        self.state.set(
            Namespace::Tasks,
            &TasksPayload {
                task_queue: tasks.to_vec(),
            },
            None,
        )
    }

    fn set_task_status(
        &self,
        tasks: &mut [WorkTask],
        index: usize,
        status: TaskStatus,
        reason: Option<String>,
    ) -> StateResult<()> {
        let task = &mut tasks[index];
        task.status = status;
        match status {
            TaskStatus::InProgress => task.started_at = Some(now_iso()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped => {
                task.completed_at = Some(now_iso())
            }
            TaskStatus::Pending => {}
        }
        if let Some(reason) = reason {
            task.failure_reason = Some(reason);
        }
        self.persist_tasks(tasks)
    }

    fn add_decision(&self, decision: Decision) -> StateResult<()> {
        self.state
            .update(Namespace::Decisions, move |mut payload: DecisionsPayload| {
                payload.decisions.push(decision.clone());
                payload
            })?;
        Ok(())
    }

    /// Planner, critic, and supervisor outputs are recorded as decisions.
    fn record_task_decision(&self, task: &WorkTask, content: &str) -> StateResult<()> {
        if !matches!(task.assigned_to.as_str(), "planner" | "critic" | "supervisor") {
            return Ok(());
        }
        self.add_decision(Decision {
            id: format!("dec-{}", task.id),
            topic: task.task_type.to_string(),
            decided_by: task.assigned_to.clone(),
            approved_by: "supervisor".into(),
            decision: truncate_chars(content, 4000),
            rationale: format!("Output from {} for {}", task.assigned_to, task.id),
            task_id: Some(task.id.clone()),
            created_at: now_iso(),
            evidence: None,
        })
    }

    fn add_conflict_decision(
        &self,
        role: &str,
        review_task: &WorkTask,
        content: &str,
    ) -> Result<()> {
        self.add_decision(Decision {
            id: format!(
                "dec-conflict-{}-{}",
                review_task.id,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            topic: "conflict_resolution".into(),
            decided_by: role.to_string(),
            approved_by: "supervisor".into(),
            decision: truncate_chars(content, 4000),
            rationale: "Automated remediation loop after blocking review findings.".into(),
            task_id: Some(review_task.id.clone()),
            created_at: now_iso(),
            evidence: None,
        })
        .map_err(|err| anyhow!("{err}"))
    }

    fn add_checkpoint(&self, checkpoint: Checkpoint) -> StateResult<()> {
        self.state.update(
            Namespace::Checkpoints,
            move |mut payload: CheckpointsPayload| {
                payload.checkpoints.push(checkpoint.clone());
                payload
            },
        )?;
        Ok(())
    }

    fn bump_metrics<F>(&self, mut mutate: F) -> StateResult<()>
    where
        F: FnMut(&mut Metrics),
    {
        self.state.update(Namespace::Metrics, move |mut metrics: Metrics| {
            mutate(&mut metrics);
            metrics
        })?;
        Ok(())
    }

    fn record_preflight(&self, report: &PreflightReport) -> StateResult<()> {
        let report = report.clone();
        self.bump_metrics(move |metrics| {
            metrics.preflight_history.push(report.clone());
            keep_last(&mut metrics.preflight_history, PREFLIGHT_HISTORY_LIMIT);
        })
    }

    fn record_dirty_isolation(&self, run_id: &str, paths: &[String]) -> StateResult<()> {
        let record = DirtyIsolationRecord {
            at: now_iso(),
            run_id: run_id.to_string(),
            paths: paths.to_vec(),
        };
        self.bump_metrics(move |metrics| {
            metrics.dirty_worktree_isolation.push(record.clone());
            keep_last(&mut metrics.dirty_worktree_isolation, DIRTY_ISOLATION_LIMIT);
        })
    }

    fn record_run_record(
        &self,
        run_id: &str,
        goal: &str,
        status: RunStatus,
        started_at: &str,
        completed_tasks: u32,
        failure: Option<String>,
    ) -> StateResult<()> {
        let record = RunRecord {
            run_id: run_id.to_string(),
            goal: goal.to_string(),
            status,
            started_at: started_at.to_string(),
            ended_at: matches!(status, RunStatus::Complete | RunStatus::Failed)
                .then(now_iso),
            completed_tasks,
            failure,
        };
        self.state.update(Namespace::Runs, move |mut runs: RunsPayload| {
            let entry = runs
                .entry(record.run_id.clone())
                .or_insert_with(|| record.clone());
            entry.status = record.status;
            if let Some(ended) = &record.ended_at {
                entry.ended_at = Some(ended.clone());
            }
            entry.completed_tasks = entry.completed_tasks.max(record.completed_tasks);
            if record.failure.is_some() {
                entry.failure = record.failure.clone();
            }
            runs
        })?;
        Ok(())
    }

    /// Failure is never silent: checkpoint, context, run record, and lease
    /// are all finalized before the error surfaces.
    fn finalize_failure(
        &self,
        run_id: &str,
        goal: &str,
        failed_task: Option<&WorkTask>,
        reason: &str,
    ) -> Result<()> {
        let checkpoint_id = match self.patches.create_checkpoint(&format!("{run_id}-failed")) {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "failed to create failure checkpoint");
                format!("architect/{run_id}-failed-unrecorded")
            }
        };
        if let Err(err) = self.add_checkpoint(Checkpoint {
            id: checkpoint_id,
            created_at: now_iso(),
            goal: goal.to_string(),
            run_id: run_id.to_string(),
            active_branch: self.patches.current_branch(),
            failure_task_id: failed_task.map(|task| task.id.clone()),
            failure_reason: Some(reason.to_string()),
        }) {
            error!(error = %err, "failed to record failure checkpoint");
        }

        let phase = failed_task.map(|task| task.task_type.phase());
        let phase_label = failed_task
            .map(|task| task.task_type.to_string())
            .unwrap_or_else(|| "run".into());
        if let Err(err) = self.state.update(Namespace::Context, move |mut ctx: RunContext| {
            ctx.status = RunStatus::Failed;
            if let Some(phase) = phase {
                ctx.phase = phase;
            }
            ctx.ended_at = Some(now_iso());
            ctx.push_phase(phase_label.clone(), "failed");
            ctx
        }) {
            error!(error = %err, "failed to finalize context after failure");
        }

        let completed = 0;
        if let Err(err) = self.record_run_record(
            run_id,
            goal,
            RunStatus::Failed,
            &now_iso(),
            completed,
            Some(reason.to_string()),
        ) {
            error!(error = %err, "failed to update run record after failure");
        }
        if let Err(err) = lease::release_lease(&self.state, run_id) {
            error!(error = %err, "failed to release lease after failure");
        }
        error!(run_id = %run_id, reason = %reason, "run failed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // User-facing controls
    // ------------------------------------------------------------------

    pub fn status(&self, verbose: bool) -> Result<Value> {
        let context: RunContext = self.state.data(Namespace::Context)?;
        let tasks: TasksPayload = self.state.data(Namespace::Tasks)?;
        let decisions: DecisionsPayload = self.state.data(Namespace::Decisions)?;
        let checkpoints: CheckpointsPayload = self.state.data(Namespace::Checkpoints)?;
        let metrics: Metrics = self.state.data(Namespace::Metrics)?;

        let tasks_json: Value = if verbose {
            serde_json::to_value(&tasks.task_queue)?
        } else {
            Value::Array(
                tasks
                    .task_queue
                    .iter()
                    .map(|task| {
                        json!({
                            "id": task.id,
                            "type": task.task_type,
                            "assigned_to": task.assigned_to,
                            "status": task.status,
                            "attempt": task.attempt,
                        })
                    })
                    .collect(),
            )
        };
        let recent_failures: Vec<&crate::contracts::GateFailure> =
            metrics.gate_failures.iter().rev().take(5).collect();
        let patches = self
            .patches
            .list_patches(None, None)
            .map_err(|err| anyhow!("{err}"))?;

        Ok(json!({
            "context": serde_json::to_value(&context)?,
            "tasks": tasks_json,
            "decisions": serde_json::to_value(&decisions.decisions)?,
            "metrics": serde_json::to_value(&metrics)?,
            "recent_gate_failures": serde_json::to_value(&recent_failures)?,
            "checkpoints": serde_json::to_value(&checkpoints.checkpoints)?,
            "patches": serde_json::to_value(&patches)?,
        }))
    }

    pub fn pause(&self) -> Result<()> {
        self.state.update(Namespace::Context, |mut ctx: RunContext| {
            ctx.paused = true;
            ctx.status = RunStatus::Paused;
            ctx
        })?;
        Ok(())
    }

    pub fn resume_workflow(&self) -> Result<()> {
        self.state.update(Namespace::Context, |mut ctx: RunContext| {
            ctx.paused = false;
            ctx.status = RunStatus::InProgress;
            if ctx.phase == crate::contracts::Phase::Idle {
                ctx.phase = crate::contracts::Phase::Implementation;
            }
            ctx
        })?;
        Ok(())
    }
}
