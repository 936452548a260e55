//! Quality gate evaluation.
//!
//! A gate runs after its task and produces a pass/fail verdict with
//! supporting artifacts. Results land in `metrics.quality_gates` (bounded);
//! failures are mirrored into `metrics.gate_failures`.

use serde_json::json;
use tracing::{info, warn};

use super::Supervisor;
use crate::backends::BackendContext;
use crate::contracts::{
    keep_last, now_iso, GateFailure, GateResult, Metrics, TaskType, WorkTask,
    GATE_FAILURES_LIMIT, QUALITY_GATES_LIMIT,
};
use crate::patch_stack::Patch;
use crate::paths;
use crate::state_store::{Namespace, StateResult};
use crate::supervisor::command::run_command;
use crate::supervisor::parsing::{extract_plan_steps, parse_review_findings};

/// Signals a plan must carry when it has fewer than two extracted steps.
const PLAN_SIGNALS: [&str; 4] = ["interface", "risk", "analysis", "milestone"];

/// Check that guarded source changes come with test changes.
///
/// Returns `Err(reason)` when files matching `require_tests_for` patterns
/// changed without any recognized test path in the same run.
pub(crate) fn tests_accompany_guarded_changes(
    run_patch_files: &[String],
    patterns: &[String],
) -> Result<(), String> {
    let guarded: Vec<&String> = run_patch_files
        .iter()
        .filter(|file| !paths::is_test_path(file))
        .filter(|file| paths::match_any(file, patterns).is_some())
        .collect();
    if guarded.is_empty() {
        return Ok(());
    }
    if run_patch_files.iter().any(|file| paths::is_test_path(file)) {
        return Ok(());
    }
    Err(format!(
        "Guardrail require_tests_for failed: source files changed without matching tests. \
         Patterns={patterns:?}"
    ))
}

/// Evidence that documentation (or a changelog) was part of the change set.
fn doc_evidence(run_patch_files: &[String], patterns: &[String], fallback_docs: bool) -> bool {
    run_patch_files.iter().any(|file| {
        paths::match_any(file, patterns).is_some() || (fallback_docs && paths::is_docs_path(file))
    })
}

impl Supervisor {
    /// Evaluate the gate for a finished task. `run_patch_files` covers every
    /// patch produced so far in the run; `current_patch` is the one created
    /// for this task, if any.
    pub(crate) async fn evaluate_gate(
        &self,
        task: &WorkTask,
        content: &str,
        run_patch_files: &[String],
        current_patch: Option<&Patch>,
    ) -> GateResult {
        let mut artifacts = Vec::new();
        let mut passed = true;
        let mut reason = String::new();
        let content = content.trim();
        let workflow = &self.config.workflow;
        let guardrails = &self.config.guardrails;

        match task.task_type {
            TaskType::Plan => {
                let steps = extract_plan_steps(content);
                artifacts.push(json!({"type": "planning_steps", "count": steps.len()}));
                if content.is_empty() || steps.is_empty() {
                    passed = false;
                    reason = "Planning output must include at least one actionable step.".into();
                }
                if passed && steps.len() < 2 {
                    let lower = content.to_lowercase();
                    if let Some(missing) =
                        PLAN_SIGNALS.iter().find(|signal| !lower.contains(**signal))
                    {
                        passed = false;
                        reason = format!(
                            "Plan with a single step must cover interface, risks, analysis, \
                             and milestones; missing signal '{missing}'."
                        );
                    }
                }
                if passed && workflow.plan_requires_critic {
                    match self.run_plan_critic(content).await {
                        Some(findings) => {
                            artifacts.push(json!({
                                "type": "plan_critic",
                                "counts": findings.as_artifact(),
                            }));
                            if findings.blocker > 0 {
                                passed = false;
                                reason = format!(
                                    "Plan critic reported {} blocker finding(s).",
                                    findings.blocker
                                );
                            }
                        }
                        None => {
                            warn!(task = %task.id, "plan critic unavailable; skipping plan review");
                        }
                    }
                }
            }

            TaskType::Implement => {
                if content.is_empty() {
                    passed = false;
                    reason = "Implementation output is empty.".into();
                }
                if passed && workflow.auto_lint {
                    let lint = run_command(&self.config.project.lint_command, &self.repo_root);
                    let ok = lint.succeeded();
                    artifacts.push(lint.artifact());
                    if !ok {
                        passed = false;
                        reason = "Lint command failed.".into();
                    }
                }
                if passed && !self.config.project.type_check_command.trim().is_empty() {
                    let check =
                        run_command(&self.config.project.type_check_command, &self.repo_root);
                    let ok = check.succeeded();
                    artifacts.push(check.artifact());
                    if !ok {
                        passed = false;
                        reason = "Type-check command failed.".into();
                    }
                }
                if passed {
                    if let Some(patch) = current_patch {
                        let max_files = guardrails.max_file_changes_per_patch;
                        let actual = patch.files_changed.len();
                        artifacts.push(json!({
                            "type": "guardrail",
                            "name": "max_file_changes_per_patch",
                            "max": max_files,
                            "actual": actual,
                        }));
                        if actual > max_files {
                            passed = false;
                            reason = format!(
                                "Guardrail max_file_changes_per_patch failed: {actual} files \
                                 changed (max {max_files})."
                            );
                        }
                    }
                }
                if passed {
                    if let Some(patch) = current_patch {
                        for file in &patch.files_changed {
                            if paths::is_internal_path(file) {
                                continue;
                            }
                            if let Some(pattern) =
                                paths::match_any(file, &guardrails.forbidden_paths)
                            {
                                passed = false;
                                reason = format!(
                                    "Forbidden path touched during implementation gate: \
                                     {file} matched {pattern}"
                                );
                                break;
                            }
                        }
                    }
                }
            }

            TaskType::Test => {
                if workflow.auto_test {
                    let test = run_command(&self.config.project.test_command, &self.repo_root);
                    let ok = test.succeeded();
                    let stdout_tail = test.stdout_tail.clone();
                    let stderr_tail = test.stderr_tail.clone();
                    artifacts.push(test.artifact());
                    if !ok {
                        passed = false;
                        reason = "Test command failed.".into();
                    }
                    let threshold = workflow.test_coverage_threshold;
                    if passed && threshold > 0 {
                        let coverage = crate::supervisor::parsing::extract_coverage_percent(
                            &stdout_tail,
                            &stderr_tail,
                        );
                        artifacts.push(json!({
                            "type": "coverage",
                            "threshold": threshold,
                            "actual": coverage,
                        }));
                        if coverage.map_or(true, |percent| percent < threshold) {
                            passed = false;
                            reason = format!(
                                "Coverage threshold failed: required {threshold}%, got {}.",
                                coverage.map_or("none".to_string(), |p| p.to_string())
                            );
                        }
                    }
                }
            }

            TaskType::Review => {
                let findings = parse_review_findings(content);
                artifacts.push(json!({"type": "findings", "counts": findings.as_artifact()}));
                if workflow.require_critic_approval && findings.blocker > 0 {
                    passed = false;
                    reason = format!("Critic reported {} blocker finding(s).", findings.blocker);
                }
                if passed && findings.major > workflow.review_max_major_findings {
                    passed = false;
                    reason = format!(
                        "Critic reported {} major finding(s) (max {}).",
                        findings.major, workflow.review_max_major_findings
                    );
                }
                if passed {
                    let coverage = tests_accompany_guarded_changes(
                        run_patch_files,
                        &guardrails.require_tests_for,
                    );
                    artifacts.push(json!({
                        "type": "guardrail",
                        "name": "require_tests_for",
                        "patterns": guardrails.require_tests_for,
                        "passed": coverage.is_ok(),
                    }));
                    if let Err(coverage_reason) = coverage {
                        passed = false;
                        reason = coverage_reason;
                    }
                }
                let source_changed = run_patch_files.iter().any(|f| paths::is_source_path(f));
                if passed && workflow.review_require_docs_update && source_changed {
                    let ok = doc_evidence(run_patch_files, &workflow.review_docs_patterns, true);
                    artifacts.push(json!({
                        "type": "guardrail",
                        "name": "review_require_docs_update",
                        "passed": ok,
                    }));
                    if !ok {
                        passed = false;
                        reason =
                            "Review gate requires a documentation update alongside source changes."
                                .into();
                    }
                }
                if passed && workflow.review_require_changelog_update && source_changed {
                    let ok =
                        doc_evidence(run_patch_files, &workflow.review_changelog_patterns, false);
                    artifacts.push(json!({
                        "type": "guardrail",
                        "name": "review_require_changelog_update",
                        "passed": ok,
                    }));
                    if !ok {
                        passed = false;
                        reason =
                            "Review gate requires a changelog update alongside source changes."
                                .into();
                    }
                }
            }

            TaskType::Document => {
                if content.is_empty() {
                    passed = false;
                    reason = "Documentation output is empty.".into();
                } else {
                    let source_touched =
                        run_patch_files.iter().any(|f| paths::is_source_path(f));
                    if source_touched {
                        let lower = content.to_lowercase();
                        let mentions_docs = ["doc", "readme", "changelog"]
                            .iter()
                            .any(|token| lower.contains(token));
                        if !mentions_docs {
                            passed = false;
                            reason = "Documentation gate requires an explicit documentation \
                                      impact summary."
                                .into();
                        }
                    }
                }
            }
        }

        let gate = GateResult {
            name: task.task_type.gate_name().to_string(),
            task_id: task.id.clone(),
            passed,
            reason,
            artifacts,
            checked_at: now_iso(),
        };
        info!(
            gate = %gate.name,
            task = %gate.task_id,
            passed = gate.passed,
            reason = %gate.reason,
            "gate evaluated"
        );
        gate
    }

    /// Run the critic over a plan and parse severity counts. `None` when no
    /// critic is wired or the call fails.
    async fn run_plan_critic(
        &self,
        plan: &str,
    ) -> Option<crate::supervisor::parsing::ReviewFindings> {
        let critic = self.specialists.get("critic")?;
        let mut context = BackendContext::new();
        context.insert("phase".into(), json!("plan_review"));
        let instruction = format!(
            "Review this implementation plan for feasibility and risk. Label findings with \
             BLOCKER/MAJOR/MINOR/SUGGESTION severities.\n\nPlan:\n{}",
            crate::contracts::truncate_chars(plan, 4000)
        );
        match critic.run(&instruction, context, None).await {
            Ok(response) => Some(parse_review_findings(&response.content)),
            Err(err) => {
                warn!(error = %err, "plan critic call failed");
                None
            }
        }
    }

    /// Append to `metrics.quality_gates`, mirroring failures into
    /// `metrics.gate_failures` (both bounded).
    pub(crate) fn record_gate_result(&self, gate: &GateResult) -> StateResult<()> {
        let gate = gate.clone();
        self.state.update(Namespace::Metrics, move |mut metrics: Metrics| {
            metrics.quality_gates.push(gate.clone());
            keep_last(&mut metrics.quality_gates, QUALITY_GATES_LIMIT);
            if !gate.passed {
                let failure = GateFailure {
                    name: gate.name.clone(),
                    task_id: gate.task_id.clone(),
                    reason: if gate.reason.is_empty() {
                        "gate failed".into()
                    } else {
                        gate.reason.clone()
                    },
                    checked_at: gate.checked_at.clone(),
                };
                metrics.gate_failures.push(failure.clone());
                keep_last(&mut metrics.gate_failures, GATE_FAILURES_LIMIT);
                metrics.last_gate_failure = Some(failure);
            }
            metrics
        })?;
        Ok(())
    }
}
