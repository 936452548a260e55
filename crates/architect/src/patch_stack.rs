//! Patch stack: turns worktree changes into atomic, traceable commits.
//!
//! Every commit created by the system becomes a patch with a stable id
//! `patch-<first 8 hex of commit hash>`. Lifecycle and file lists are mirrored
//! into the `metrics` namespace (`patch_index`, `patch_lifecycle`,
//! `patch_stack`) so user-facing surfaces can resolve and act on patches.
//! Rejection is non-destructive (a revert commit) and rollback always lands on
//! a fresh safety branch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::config::FallbackArtifactMode;
use crate::contracts::{now_iso, now_stamp, Metrics};
use crate::paths;
use crate::state_store::{Namespace, StateError, StateResult, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Modified,
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Modified => "modified",
        };
        write!(f, "{s}")
    }
}

/// An enumerated patch as returned by listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub patch_id: String,
    pub commit_hash: String,
    pub subject: String,
    pub status: PatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// Wire-stable patch metadata record kept in `metrics.patch_stack` and on the
/// session. Keys are read by the user-facing review/accept/reject surfaces, so
/// they serialize literally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub patch_id: String,
    pub commit_hash: String,
    pub subject: String,
    pub status: PatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_note: Option<String>,
}

/// Inputs for staging the current worktree into a task patch.
pub struct WorktreePatchRequest<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub task_id: &'a str,
    pub run_id: &'a str,
    /// File written and committed when the worktree has nothing to commit and
    /// the fallback mode is `tracked`.
    pub fallback_file: Option<&'a Path>,
    pub fallback_content: Option<&'a str>,
    pub fallback_mode: FallbackArtifactMode,
    pub max_files: usize,
    pub forbidden_paths: &'a [String],
    /// Paths left out of staging (isolated dirty files from before the run).
    pub exclude_paths: &'a [String],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalCheckpoints {
    #[serde(default)]
    checkpoints: Vec<String>,
}

pub struct PatchStack {
    repo_root: PathBuf,
    state: Option<Arc<StateStore>>,
    local_checkpoints_file: PathBuf,
    git_available: bool,
}

impl PatchStack {
    pub fn new(repo_root: &Path, state: Option<Arc<StateStore>>) -> StateResult<Self> {
        let repo_root = repo_root
            .canonicalize()
            .unwrap_or_else(|_| repo_root.to_path_buf());
        let architect_dir = repo_root.join(".architect");
        fs::create_dir_all(&architect_dir)?;
        let git_available = Command::new("git")
            .args(["--no-pager", "rev-parse", "--is-inside-work-tree"])
            .current_dir(&repo_root)
            .stdin(Stdio::null())
            .output()
            .map(|out| {
                out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true"
            })
            .unwrap_or(false);
        Ok(Self {
            local_checkpoints_file: architect_dir.join("checkpoints.json"),
            repo_root,
            state,
            git_available,
        })
    }

    pub fn git_enabled(&self) -> bool {
        self.git_available
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn patch_id_for_commit(commit_hash: &str) -> String {
        format!("patch-{}", &commit_hash[..commit_hash.len().min(8)])
    }

    fn run_git(&self, args: &[&str], check: bool) -> StateResult<(i32, String, String)> {
        if !self.git_available {
            return Err(StateError::Other(
                "No git repository found. Git patch-stack operations are disabled.".into(),
            ));
        }
        let output = Command::new("git")
            .arg("--no-pager")
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| StateError::Git(format!("failed to launch git: {err}")))?;
        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if check && code != 0 {
            return Err(StateError::Git(if stderr.is_empty() {
                stdout
            } else {
                stderr
            }));
        }
        Ok((code, stdout, stderr))
    }

    // -- branches and listings ---------------------------------------------

    /// Paths reported dirty by `git status --porcelain` (renames resolve to
    /// the new path).
    pub fn worktree_status(&self) -> StateResult<Vec<String>> {
        if !self.git_available {
            return Ok(Vec::new());
        }
        let (_, stdout, _) = self.run_git(&["status", "--porcelain"], true)?;
        Ok(stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let path = line[3..].trim();
                match path.split_once(" -> ") {
                    Some((_, renamed)) => renamed.trim().to_string(),
                    None => path.to_string(),
                }
            })
            .filter(|path| !path.is_empty())
            .collect())
    }

    pub fn current_branch(&self) -> String {
        if !self.git_available {
            return "no-git".into();
        }
        self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"], true)
            .map(|(_, stdout, _)| stdout)
            .unwrap_or_else(|_| "no-git".into())
    }

    pub fn create_branch(&self, branch_name: &str, start_point: &str) -> StateResult<()> {
        self.run_git(&["checkout", "-B", branch_name, start_point], true)?;
        Ok(())
    }

    pub fn changed_files_for_commit(&self, commit_hash: &str) -> Vec<String> {
        if !self.git_available {
            return Vec::new();
        }
        match self.run_git(
            &["show", "--pretty=format:", "--name-only", commit_hash],
            false,
        ) {
            Ok((0, stdout, _)) => stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// List commits in `base_ref..HEAD` (or an explicit `commit_scope` range)
    /// as patches, enriched from the metrics bookkeeping. Missing index rows
    /// are backfilled as a side effect so externally-created commits still get
    /// stable ids.
    pub fn list_patches(
        &self,
        base_ref: Option<&str>,
        commit_scope: Option<&str>,
    ) -> StateResult<Vec<Patch>> {
        if !self.git_available {
            return Ok(Vec::new());
        }
        let range = match (commit_scope, base_ref) {
            (Some(scope), _) => scope.to_string(),
            (None, Some(base)) => format!("{base}..HEAD"),
            (None, None) => "HEAD".to_string(),
        };
        let (code, stdout, _) = self.run_git(
            &["log", "--reverse", "--pretty=format:%H%x09%s", &range],
            false,
        )?;
        if code != 0 || stdout.is_empty() {
            return Ok(Vec::new());
        }

        let metrics = self.metrics();
        let mut patches = Vec::new();
        for line in stdout.lines() {
            let (commit_hash, subject) = line.split_once('\t').unwrap_or((line, ""));
            let commit_hash = commit_hash.trim().to_string();
            let patch_id = metrics
                .patch_index
                .get(&commit_hash)
                .cloned()
                .unwrap_or_else(|| Self::patch_id_for_commit(&commit_hash));
            let status = metrics
                .patch_lifecycle
                .get(&commit_hash)
                .copied()
                .unwrap_or_default();
            let task_id = metrics
                .patch_stack
                .iter()
                .find(|item| item.commit_hash == commit_hash)
                .and_then(|item| item.task_id.clone());
            let files_changed = self.changed_files_for_commit(&commit_hash);
            patches.push(Patch {
                patch_id,
                commit_hash,
                subject: subject.trim().to_string(),
                status,
                task_id,
                files_changed,
            });
        }

        self.ensure_patch_indexes(&patches)?;
        Ok(patches)
    }

    /// Resolution order: exact patch id, commit-hash prefix, patch-id prefix,
    /// then the legacy positional form `patch-NNN` (1-based).
    pub fn resolve_patch(
        &self,
        patch_ref: &str,
        commit_scope: Option<&str>,
    ) -> StateResult<Option<Patch>> {
        let patches = self.list_patches(None, commit_scope)?;

        if let Some(found) = patches.iter().find(|p| p.patch_id == patch_ref) {
            return Ok(Some(found.clone()));
        }
        if let Some(found) = patches.iter().find(|p| p.commit_hash.starts_with(patch_ref)) {
            return Ok(Some(found.clone()));
        }
        if let Some(found) = patches.iter().find(|p| p.patch_id.starts_with(patch_ref)) {
            return Ok(Some(found.clone()));
        }
        if let Some(digits) = patch_ref.strip_prefix("patch-") {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                let index = digits.parse::<usize>().unwrap_or(0);
                if index >= 1 && index <= patches.len() {
                    return Ok(Some(patches[index - 1].clone()));
                }
            }
        }
        Ok(None)
    }

    pub fn describe_patch(&self, patch_ref: &str) -> StateResult<String> {
        let patch = self
            .resolve_patch(patch_ref, None)?
            .ok_or_else(|| StateError::Other(format!("Patch not found: {patch_ref}")))?;
        let (_, stdout, _) = self.run_git(
            &["show", "--stat", "--pretty=format:%H%n%s%n%b", &patch.commit_hash],
            true,
        )?;
        Ok(stdout)
    }

    // -- metrics bookkeeping ------------------------------------------------

    fn metrics(&self) -> Metrics {
        match &self.state {
            Some(state) => state.data(Namespace::Metrics).unwrap_or_default(),
            None => Metrics::default(),
        }
    }

    fn update_metrics<F: FnMut(Metrics) -> Metrics>(&self, updater: F) -> StateResult<()> {
        if let Some(state) = &self.state {
            state.update(Namespace::Metrics, updater)?;
        }
        Ok(())
    }

    fn ensure_patch_indexes(&self, patches: &[Patch]) -> StateResult<()> {
        if self.state.is_none() || patches.is_empty() {
            return Ok(());
        }
        let patches = patches.to_vec();
        self.update_metrics(move |mut metrics| {
            let now = now_iso();
            for patch in &patches {
                metrics
                    .patch_index
                    .entry(patch.commit_hash.clone())
                    .or_insert_with(|| patch.patch_id.clone());
                metrics
                    .patch_lifecycle
                    .entry(patch.commit_hash.clone())
                    .or_insert(patch.status);
                if !metrics
                    .patch_stack
                    .iter()
                    .any(|item| item.commit_hash == patch.commit_hash)
                {
                    metrics.patch_stack.push(PatchRecord {
                        patch_id: patch.patch_id.clone(),
                        commit_hash: patch.commit_hash.clone(),
                        subject: patch.subject.clone(),
                        status: patch.status,
                        task_id: patch.task_id.clone(),
                        run_id: None,
                        created_at: now.clone(),
                        updated_at: None,
                        files_changed: patch.files_changed.clone(),
                        checkpoint_id: None,
                        status_note: None,
                    });
                }
            }
            metrics
        })
    }

    /// Record a freshly-created commit as a patch.
    pub fn record_patch(
        &self,
        commit_hash: &str,
        subject: &str,
        task_id: &str,
        run_id: Option<&str>,
    ) -> StateResult<Patch> {
        let patch = Patch {
            patch_id: Self::patch_id_for_commit(commit_hash),
            commit_hash: commit_hash.to_string(),
            subject: subject.to_string(),
            status: PatchStatus::Pending,
            task_id: Some(task_id.to_string()),
            files_changed: self.changed_files_for_commit(commit_hash),
        };
        let record = PatchRecord {
            patch_id: patch.patch_id.clone(),
            commit_hash: patch.commit_hash.clone(),
            subject: patch.subject.clone(),
            status: patch.status,
            task_id: patch.task_id.clone(),
            run_id: run_id.map(str::to_string),
            created_at: now_iso(),
            updated_at: None,
            files_changed: patch.files_changed.clone(),
            checkpoint_id: None,
            status_note: None,
        };
        self.update_metrics(move |mut metrics| {
            metrics
                .patch_index
                .insert(record.commit_hash.clone(), record.patch_id.clone());
            metrics
                .patch_lifecycle
                .insert(record.commit_hash.clone(), record.status);
            metrics.patch_stack.push(record.clone());
            metrics
        })?;
        Ok(patch)
    }

    /// Bookkeeping-only patch for environments without version control. The
    /// synthetic hash keeps the `patch-<8 hex>` id invariant intact.
    pub fn record_local_patch(
        &self,
        subject: &str,
        task_id: &str,
        run_id: Option<&str>,
        artifact: &Path,
    ) -> StateResult<Patch> {
        let pseudo_hash = uuid::Uuid::new_v4().simple().to_string();
        let rel = artifact
            .strip_prefix(&self.repo_root)
            .unwrap_or(artifact)
            .to_string_lossy()
            .to_string();
        let patch = Patch {
            patch_id: Self::patch_id_for_commit(&pseudo_hash),
            commit_hash: pseudo_hash.clone(),
            subject: subject.to_string(),
            status: PatchStatus::Pending,
            task_id: Some(task_id.to_string()),
            files_changed: vec![rel.clone()],
        };
        let record = PatchRecord {
            patch_id: patch.patch_id.clone(),
            commit_hash: pseudo_hash,
            subject: subject.to_string(),
            status: PatchStatus::Pending,
            task_id: Some(task_id.to_string()),
            run_id: run_id.map(str::to_string),
            created_at: now_iso(),
            updated_at: None,
            files_changed: vec![rel],
            checkpoint_id: None,
            status_note: Some("local artifact (no VCS)".into()),
        };
        self.update_metrics(move |mut metrics| {
            metrics
                .patch_index
                .insert(record.commit_hash.clone(), record.patch_id.clone());
            metrics
                .patch_lifecycle
                .insert(record.commit_hash.clone(), record.status);
            metrics.patch_stack.push(record.clone());
            metrics
        })?;
        Ok(patch)
    }

    pub fn update_patch_status(
        &self,
        commit_hash: &str,
        status: PatchStatus,
        note: Option<&str>,
    ) -> StateResult<()> {
        let commit_hash = commit_hash.to_string();
        let note = note.map(str::to_string);
        self.update_metrics(move |mut metrics| {
            metrics.patch_lifecycle.insert(commit_hash.clone(), status);
            let now = now_iso();
            for item in &mut metrics.patch_stack {
                if item.commit_hash == commit_hash {
                    item.status = status;
                    item.updated_at = Some(now.clone());
                    if let Some(note) = &note {
                        item.status_note = Some(note.clone());
                    }
                }
            }
            metrics
        })
    }

    // -- staging and committing --------------------------------------------

    fn staged_files(&self) -> StateResult<Vec<String>> {
        let (_, stdout, _) = self.run_git(&["diff", "--cached", "--name-only"], true)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn unstage_all(&self) {
        let _ = self.run_git(&["reset", "-q"], false);
    }

    /// Stage the worktree and commit it as a task patch, enforcing guardrails
    /// before the commit exists. On a guardrail violation the index is
    /// restored and the working tree is untouched.
    pub fn create_task_patch_from_worktree(
        &self,
        request: &WorktreePatchRequest<'_>,
    ) -> StateResult<Patch> {
        if !self.git_available {
            return Err(StateError::Other(
                "Creating a patch requires a git repository.".into(),
            ));
        }

        self.run_git(&["add", "-A"], true)?;
        // Tool-internal artifacts never ride along in a task patch.
        let _ = self.run_git(
            &["reset", "-q", "--", ".architect", "architect.toml"],
            false,
        );
        for excluded in request.exclude_paths {
            // Leave isolated pre-run dirt out of the patch.
            let _ = self.run_git(&["reset", "-q", "--", excluded], false);
        }

        let staged = self.staged_files()?;
        if staged.is_empty() {
            self.unstage_all();
            return self.commit_fallback(request);
        }

        for file in &staged {
            if paths::is_internal_path(file) {
                continue;
            }
            if let Some(pattern) = paths::match_any(file, request.forbidden_paths) {
                self.unstage_all();
                return Err(StateError::Guardrail(format!(
                    "staged path '{file}' matches forbidden pattern '{pattern}'"
                )));
            }
        }
        if staged.len() > request.max_files {
            self.unstage_all();
            return Err(StateError::Guardrail(format!(
                "{} files staged (max {} per patch)",
                staged.len(),
                request.max_files
            )));
        }

        self.run_git(&["commit", "-m", request.subject, "-m", request.body], true)?;
        let (_, commit_hash, _) = self.run_git(&["rev-parse", "HEAD"], true)?;
        self.record_patch(&commit_hash, request.subject, request.task_id, Some(request.run_id))
    }

    fn commit_fallback(&self, request: &WorktreePatchRequest<'_>) -> StateResult<Patch> {
        match request.fallback_mode {
            FallbackArtifactMode::Tracked => {
                let (file, content) = match (request.fallback_file, request.fallback_content) {
                    (Some(file), Some(content)) => (file, content),
                    _ => {
                        return Err(StateError::Other(
                            "nothing to commit and no fallback artifact configured".into(),
                        ))
                    }
                };
                if let Some(parent) = file.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(file, content)?;
                let rel = file
                    .strip_prefix(&self.repo_root)
                    .unwrap_or(file)
                    .to_string_lossy()
                    .to_string();
                self.run_git(&["add", "--", &rel], true)?;
                self.run_git(&["commit", "-m", request.subject, "-m", request.body], true)?;
                let (_, commit_hash, _) = self.run_git(&["rev-parse", "HEAD"], true)?;
                self.record_patch(
                    &commit_hash,
                    request.subject,
                    request.task_id,
                    Some(request.run_id),
                )
            }
            FallbackArtifactMode::LocalOnly => {
                let artifact = request
                    .fallback_file
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| {
                        self.repo_root
                            .join(".architect")
                            .join("runs")
                            .join(request.run_id)
                            .join(format!("{}.md", request.task_id))
                    });
                self.record_local_patch(
                    request.subject,
                    request.task_id,
                    Some(request.run_id),
                    &artifact,
                )
            }
        }
    }

    // -- rejection, checkpoints, rollback ----------------------------------

    /// Undo a patch with a new revert commit. The original commit stays
    /// reachable; on conflict the repository is restored to the prior HEAD.
    pub fn reject_patch(&self, patch_ref: &str) -> StateResult<Patch> {
        let patch = self
            .resolve_patch(patch_ref, None)?
            .ok_or_else(|| StateError::Other(format!("Patch not found: {patch_ref}")))?;

        let (_, head_before, _) = self.run_git(&["rev-parse", "HEAD"], true)?;
        let (code, _, stderr) =
            self.run_git(&["revert", "--no-edit", &patch.commit_hash], false)?;
        if code != 0 {
            let _ = self.run_git(&["revert", "--abort"], false);
            let _ = self.run_git(&["reset", "--hard", &head_before], false);
            return Err(StateError::Other(format!(
                "Reject failed due to revert conflict; repository restored to previous HEAD. {stderr}"
            )));
        }

        self.update_patch_status(
            &patch.commit_hash,
            PatchStatus::Rejected,
            Some("Reverted by reject"),
        )?;
        Ok(patch)
    }

    fn sanitize_checkpoint_name(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut last_dash = false;
        for ch in name.trim().to_lowercase().chars() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                out.push(ch);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        let trimmed = out.trim_matches('-').to_string();
        if trimmed.is_empty() {
            "checkpoint".into()
        } else {
            trimmed
        }
    }

    fn read_local_checkpoints(&self) -> Vec<String> {
        fs::read_to_string(&self.local_checkpoints_file)
            .ok()
            .and_then(|raw| serde_json::from_str::<LocalCheckpoints>(&raw).ok())
            .map(|payload| payload.checkpoints)
            .unwrap_or_default()
    }

    fn write_local_checkpoints(&self, checkpoints: Vec<String>) -> StateResult<()> {
        let payload = LocalCheckpoints { checkpoints };
        fs::write(
            &self.local_checkpoints_file,
            serde_json::to_string_pretty(&payload)?,
        )?;
        Ok(())
    }

    /// Create a checkpoint tag `architect/<name>-<utc-stamp>`, or append to
    /// the local checkpoint list without VCS.
    pub fn create_checkpoint(&self, name: &str) -> StateResult<String> {
        let checkpoint_id = format!(
            "architect/{}-{}",
            Self::sanitize_checkpoint_name(name),
            now_stamp()
        );
        if self.git_available {
            self.run_git(&["tag", "-f", &checkpoint_id], true)?;
            return Ok(checkpoint_id);
        }
        let mut checkpoints = self.read_local_checkpoints();
        checkpoints.push(checkpoint_id.clone());
        self.write_local_checkpoints(checkpoints)?;
        Ok(checkpoint_id)
    }

    pub fn list_checkpoints(&self) -> Vec<String> {
        if self.git_available {
            return self
                .run_git(
                    &["tag", "--list", "architect/*", "--sort=creatordate"],
                    false,
                )
                .map(|(code, stdout, _)| {
                    if code != 0 {
                        Vec::new()
                    } else {
                        stdout
                            .lines()
                            .map(str::trim)
                            .filter(|line| !line.is_empty())
                            .map(str::to_string)
                            .collect()
                    }
                })
                .unwrap_or_default();
        }
        self.read_local_checkpoints()
    }

    /// Switch to a new safety branch pointing at the checkpoint. The caller's
    /// previous branch is left untouched.
    pub fn rollback(&self, checkpoint_id: &str) -> StateResult<String> {
        if !self.git_available {
            return Err(StateError::Other("Rollback requires a git repository.".into()));
        }
        let verify = format!("{checkpoint_id}^{{commit}}");
        self.run_git(&["rev-parse", "--verify", &verify], true)
            .map_err(|_| StateError::Other(format!("Checkpoint not found: {checkpoint_id}")))?;
        let branch = format!("architect/rollback-{}", now_stamp());
        self.run_git(&["checkout", "-b", &branch, checkpoint_id], true)?;
        Ok(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_id_is_first_eight_hex() {
        assert_eq!(
            PatchStack::patch_id_for_commit("0123456789abcdef0123456789abcdef01234567"),
            "patch-01234567"
        );
    }

    #[test]
    fn sanitize_checkpoint_names() {
        assert_eq!(
            PatchStack::sanitize_checkpoint_name("Run 42: complete!"),
            "run-42-complete"
        );
        assert_eq!(PatchStack::sanitize_checkpoint_name("  "), "checkpoint");
        assert_eq!(
            PatchStack::sanitize_checkpoint_name("run-abc_1.2"),
            "run-abc_1.2"
        );
    }

    #[test]
    fn patch_record_serializes_wire_keys() {
        let record = PatchRecord {
            patch_id: "patch-0badc0de".into(),
            commit_hash: "0badc0de".into(),
            subject: "architect: task-implement-001".into(),
            status: PatchStatus::Pending,
            task_id: Some("task-implement-001".into()),
            run_id: Some("run-x".into()),
            created_at: now_iso(),
            updated_at: None,
            files_changed: vec!["src/lib.rs".into()],
            checkpoint_id: None,
            status_note: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["patch_id"], "patch-0badc0de");
        assert_eq!(json["commit_hash"], "0badc0de");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["files_changed"][0], "src/lib.rs");
        assert!(json.get("updated_at").is_none());
    }
}
