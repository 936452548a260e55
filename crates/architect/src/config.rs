//! `architect.toml` configuration model.
//!
//! Every knob the supervisor, gates, dispatcher, and patch stack consume lives
//! here. Missing file or missing keys fall back to defaults so a bare
//! `architect run` works in any cargo project.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Commands run by the quality gates against the managed project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub language: String,
    pub test_command: String,
    pub lint_command: String,
    /// Empty string disables the type-check step of the implementation gate.
    pub type_check_command: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "my-project".into(),
            language: "rust".into(),
            test_command: "cargo test".into(),
            lint_command: "cargo clippy --all-targets -- -D warnings".into(),
            type_check_command: "cargo check".into(),
        }
    }
}

/// External agent CLI pair plus the retry policy applied to every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub primary: String,
    pub fallback: String,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    pub timeout_seconds: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            primary: "claude".into(),
            fallback: "codex".into(),
            max_retries: 1,
            retry_backoff_seconds: 0.5,
            timeout_seconds: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub supervisor_model: String,
    pub specialist_model: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            supervisor_model: "claude-sonnet-4-5".into(),
            specialist_model: "claude-sonnet-4-5".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    AuxiliaryBranches,
    CurrentBranch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyWorktreeMode {
    Refuse,
    Isolate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackArtifactMode {
    Tracked,
    LocalOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_patches_before_review: usize,
    pub auto_test: bool,
    pub auto_lint: bool,
    pub require_critic_approval: bool,
    pub plan_requires_critic: bool,
    pub test_coverage_threshold: u32,
    pub review_max_major_findings: u32,
    pub review_require_docs_update: bool,
    pub review_require_changelog_update: bool,
    pub review_docs_patterns: Vec<String>,
    pub review_changelog_patterns: Vec<String>,
    pub max_parallel_tasks: usize,
    pub task_max_attempts: u32,
    pub task_retry_backoff_seconds: f64,
    pub max_conflict_cycles: u32,
    pub branch_strategy: BranchStrategy,
    pub dirty_worktree_mode: DirtyWorktreeMode,
    pub fallback_artifact_mode: FallbackArtifactMode,
    pub tracked_fallback_dir: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_patches_before_review: 5,
            auto_test: true,
            auto_lint: true,
            require_critic_approval: true,
            plan_requires_critic: false,
            test_coverage_threshold: 0,
            review_max_major_findings: 3,
            review_require_docs_update: false,
            review_require_changelog_update: false,
            review_docs_patterns: vec!["README*".into(), "docs/**".into(), "*.md".into()],
            review_changelog_patterns: vec!["CHANGELOG*".into()],
            max_parallel_tasks: 2,
            task_max_attempts: 2,
            task_retry_backoff_seconds: 0.5,
            max_conflict_cycles: 2,
            branch_strategy: BranchStrategy::AuxiliaryBranches,
            dirty_worktree_mode: DirtyWorktreeMode::Refuse,
            fallback_artifact_mode: FallbackArtifactMode::Tracked,
            tracked_fallback_dir: "docs/architect-runs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub max_file_changes_per_patch: usize,
    pub forbidden_paths: Vec<String>,
    pub require_tests_for: Vec<String>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_file_changes_per_patch: 10,
            forbidden_paths: vec![
                ".env".into(),
                "secrets/*".into(),
                "production.config.*".into(),
            ],
            require_tests_for: vec!["src/**/*.rs".into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendMode {
    Notes,
    Branch,
    Local,
}

impl fmt::Display for StateBackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Notes => "notes",
            Self::Branch => "branch",
            Self::Local => "local",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackendMode,
    pub branch_ref: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendMode::Notes,
            branch_ref: "architect/state".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectConfig {
    pub project: ProjectConfig,
    pub backend: BackendConfig,
    pub agents: AgentsConfig,
    pub workflow: WorkflowConfig,
    pub guardrails: GuardrailsConfig,
    pub state: StateConfig,
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist.
pub fn load_config(path: &Path) -> Result<ArchitectConfig> {
    if !path.exists() {
        return Ok(ArchitectConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config at {}", path.display()))
}

pub fn save_config(path: &Path, config: &ArchitectConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("failed to render config")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("failed to write config at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ArchitectConfig::default();
        assert_eq!(config.backend.primary, "claude");
        assert_eq!(config.backend.fallback, "codex");
        assert_eq!(config.workflow.max_patches_before_review, 5);
        assert_eq!(config.guardrails.max_file_changes_per_patch, 10);
        assert_eq!(config.state.backend, StateBackendMode::Notes);
        assert!(config.workflow.require_critic_approval);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ArchitectConfig = toml::from_str(
            r#"
            [backend]
            primary = "codex"

            [workflow]
            max_parallel_tasks = 4
            dirty_worktree_mode = "isolate"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.primary, "codex");
        assert_eq!(config.backend.fallback, "codex");
        assert_eq!(config.workflow.max_parallel_tasks, 4);
        assert_eq!(
            config.workflow.dirty_worktree_mode,
            DirtyWorktreeMode::Isolate
        );
        // Untouched sections keep their defaults.
        assert!(config.workflow.auto_lint);
        assert_eq!(config.project.test_command, "cargo test");
    }

    #[test]
    fn round_trip_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("architect.toml");
        let mut config = ArchitectConfig::default();
        config.workflow.test_coverage_threshold = 80;
        config.guardrails.forbidden_paths.push("*.pem".into());
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.workflow.test_coverage_threshold, 80);
        assert!(loaded
            .guardrails
            .forbidden_paths
            .contains(&"*.pem".to_string()));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/architect.toml")).unwrap();
        assert_eq!(config.backend.max_retries, 1);
    }
}
