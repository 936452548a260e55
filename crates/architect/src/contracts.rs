//! Shared data contracts: tasks, decisions, checkpoints, runs, leases, and the
//! metrics namespace. These are the JSON shapes persisted through the state
//! store, so field names are wire-stable.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::patch_stack::{PatchRecord, PatchStatus};

/// UTC timestamp in ISO-8601 with second precision, the format used across
/// every persisted record.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// UTC timestamp compacted for identifiers (run ids, checkpoint tags).
pub fn now_stamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Keep the last `n` characters of `s`, respecting UTF-8 boundaries.
pub fn tail_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Drop everything but the last `n` entries of a bounded history.
pub fn keep_last<T>(items: &mut Vec<T>, n: usize) {
    if items.len() > n {
        let excess = items.len() - n;
        items.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// The five task types the supervisor schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Implement,
    Test,
    Review,
    Document,
}

impl TaskType {
    /// Specialist role a task of this type is dispatched to.
    pub fn specialist_role(self) -> &'static str {
        match self {
            Self::Plan => "planner",
            Self::Implement => "coder",
            Self::Test => "tester",
            Self::Review => "critic",
            Self::Document => "documenter",
        }
    }

    /// Name of the quality gate evaluated after a task of this type.
    pub fn gate_name(self) -> &'static str {
        match self {
            Self::Plan => "planning_gate",
            Self::Implement => "implementation_gate",
            Self::Test => "testing_gate",
            Self::Review => "review_gate",
            Self::Document => "documentation_gate",
        }
    }

    /// Default tool allow-list for a task of this type. `None` means the
    /// specialist runs without tools.
    pub fn default_tools(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Plan => None,
            Self::Implement => Some(&[
                "read_file",
                "write_file",
                "edit_file",
                "run_command",
                "search",
            ]),
            Self::Test => Some(&["read_file", "run_command"]),
            Self::Review => Some(&["read_file", "run_command", "search"]),
            Self::Document => Some(&["read_file", "write_file", "edit_file", "search"]),
        }
    }

    /// Task types that stage and commit worktree changes must never run in
    /// parallel with each other.
    pub fn mutates_worktree(self) -> bool {
        matches!(self, Self::Implement | Self::Document)
    }

    /// Phase the run enters while a task of this type executes.
    pub fn phase(self) -> Phase {
        match self {
            Self::Plan => Phase::Planning,
            Self::Implement => Phase::Implementation,
            Self::Test | Self::Review => Phase::Review,
            Self::Document => Phase::Documentation,
        }
    }

    /// Phase the run advances to once a task of this type completes.
    pub fn next_phase(self) -> Phase {
        match self {
            Self::Plan | Self::Implement => Phase::Implementation,
            Self::Test => Phase::Review,
            Self::Review => Phase::Documentation,
            Self::Document => Phase::Complete,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// A unit of work assigned to one specialist.
///
/// Invariant: `depends_on` forms a DAG over task ids, and a task only enters
/// `in_progress` once every dependency is `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub assigned_to: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub output_summary: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

impl WorkTask {
    pub fn new(
        id: impl Into<String>,
        task_type: TaskType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type,
            assigned_to: task_type.specialist_role().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            created_at: now_iso(),
            started_at: None,
            completed_at: None,
            output_summary: String::new(),
            attempt: 0,
            failure_reason: None,
            patch_id: None,
            allowed_tools: None,
        }
    }

    pub fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksPayload {
    #[serde(default)]
    pub task_queue: Vec<WorkTask>,
}

// ---------------------------------------------------------------------------
// Decisions and checkpoints
// ---------------------------------------------------------------------------

/// Append-only decision record (planner replans, critic rulings, user
/// accept/reject actions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub topic: String,
    pub decided_by: String,
    pub approved_by: String,
    pub decision: String,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionsPayload {
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(default = "now_iso")]
    pub created_at: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub active_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointsPayload {
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    Implementation,
    Review,
    Documentation,
    Complete,
    Paused,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::Documentation => "documentation",
            Self::Complete => "complete",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Ready,
    InProgress,
    Paused,
    Complete,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: String,
    pub status: String,
    pub at: String,
}

/// Per-run session snapshot embedded in the context namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub run_id: Option<String>,
    pub goal: String,
    pub base_branch: String,
    pub active_branch: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub checkpoint_id: Option<String>,
    pub phase_history: Vec<PhaseEvent>,
    pub patch_stack: Vec<PatchRecord>,
}

/// Result of the preflight probe performed before every fresh run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightReport {
    pub checked_at: String,
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirtyWorktreeState {
    pub mode: String,
    pub isolated_paths: Vec<String>,
}

/// The single live record in the `context` namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunContext {
    pub goal: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub active_branch: String,
    pub paused: bool,
    pub current_run_id: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub session: Session,
    pub preflight: Option<PreflightReport>,
    pub dirty_worktree: Option<DirtyWorktreeState>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RunContext {
    pub fn push_phase(&mut self, phase: impl fmt::Display, status: &str) {
        self.session.phase_history.push(PhaseEvent {
            phase: phase.to_string(),
            status: status.to_string(),
            at: now_iso(),
        });
    }
}

// ---------------------------------------------------------------------------
// Runs and leases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub completed_tasks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// The `runs` namespace is keyed by run id.
pub type RunsPayload = BTreeMap<String, RunRecord>;

/// Single-writer token pinning one active run to one state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub run_id: String,
    pub heartbeat_at: String,
    pub expires_epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Lease {
    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_epoch <= now_epoch
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeasesPayload {
    #[serde(default)]
    pub active: Option<Lease>,
}

// ---------------------------------------------------------------------------
// Gates and metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub task_id: String,
    pub passed: bool,
    pub reason: String,
    #[serde(default)]
    pub artifacts: Vec<Value>,
    pub checked_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFailure {
    pub name: String,
    pub task_id: String,
    pub reason: String,
    pub checked_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyIsolationRecord {
    pub at: String,
    pub run_id: String,
    pub paths: Vec<String>,
}

/// Bounds for the rolling histories kept in `metrics`.
pub const QUALITY_GATES_LIMIT: usize = 200;
pub const GATE_FAILURES_LIMIT: usize = 50;
pub const BACKEND_EVENTS_LIMIT: usize = 200;
pub const PREFLIGHT_HISTORY_LIMIT: usize = 30;
pub const DIRTY_ISOLATION_LIMIT: usize = 20;

/// The merged `metrics` namespace: counters, bounded histories, and the patch
/// bookkeeping owned by the patch stack. Unknown keys written by older
/// versions ride along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub task_retry_count: u64,
    pub replan_count: u64,
    pub backend_retry_count: u64,
    pub backend_fallback_count: u64,
    pub last_run_completed_tasks: u64,
    pub scheduler_parallelism: u64,
    pub conflict_resolution_cycles: u64,
    pub quality_gates: Vec<GateResult>,
    pub gate_failures: Vec<GateFailure>,
    pub last_gate_failure: Option<GateFailure>,
    pub backend_events: Vec<Value>,
    pub preflight_history: Vec<PreflightReport>,
    pub dirty_worktree_isolation: Vec<DirtyIsolationRecord>,
    pub patch_index: BTreeMap<String, String>,
    pub patch_lifecycle: BTreeMap<String, PatchStatus>,
    pub patch_stack: Vec<PatchRecord>,
    pub last_run_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Returned by `Supervisor::run` once the task graph completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub goal: String,
    pub run_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub checkpoint_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_serde() {
        let task = WorkTask::new("task-plan-001", TaskType::Plan, "Plan the work");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "plan");
        assert_eq!(json["status"], "pending");
        let back: WorkTask = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_type, TaskType::Plan);
        assert_eq!(back.assigned_to, "planner");
    }

    #[test]
    fn default_tools_match_task_types() {
        assert!(TaskType::Plan.default_tools().is_none());
        assert_eq!(TaskType::Test.default_tools().unwrap().len(), 2);
        assert!(TaskType::Implement
            .default_tools()
            .unwrap()
            .contains(&"write_file"));
    }

    #[test]
    fn worktree_mutators_are_implement_and_document() {
        assert!(TaskType::Implement.mutates_worktree());
        assert!(TaskType::Document.mutates_worktree());
        assert!(!TaskType::Test.mutates_worktree());
        assert!(!TaskType::Review.mutates_worktree());
        assert!(!TaskType::Plan.mutates_worktree());
    }

    #[test]
    fn keep_last_truncates_from_the_front() {
        let mut v: Vec<u32> = (0..10).collect();
        keep_last(&mut v, 3);
        assert_eq!(v, vec![7, 8, 9]);
    }

    #[test]
    fn tail_chars_respects_utf8_boundaries() {
        let s = "héllo wörld";
        let t = tail_chars(s, 4);
        assert!(t.len() <= 4);
        assert!(s.ends_with(&t));
    }

    #[test]
    fn legacy_context_payload_parses_with_defaults() {
        let raw = serde_json::json!({
            "goal": "older goal",
            "phase": "planning",
            "unknown_key": 42,
        });
        let ctx: RunContext = serde_json::from_value(raw).unwrap();
        assert_eq!(ctx.goal, "older goal");
        assert_eq!(ctx.phase, Phase::Planning);
        assert_eq!(ctx.extra.get("unknown_key").unwrap(), 42);
    }
}
