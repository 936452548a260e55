//! Namespaced JSON envelope store with optimistic concurrency.
//!
//! Each namespace holds one envelope `{schema_version, revision, updated_at,
//! data}`. Three backings share the same contract:
//!
//! - `notes`: one commit-note per namespace under a stable anchor blob,
//!   ref `refs/notes/architect/<ns>`.
//! - `branch`: a dedicated, never-checked-out branch whose tree carries one
//!   `<ns>.json` blob per namespace; every write is a new commit on that ref.
//! - `local`: plain files under `.architect/state/`, also the forced mode when
//!   the working directory is not a git worktree.
//!
//! Every write holds an exclusive on-disk lock and bumps `revision`; `set`
//! with a stale `expected_revision` fails with [`StateError::Concurrency`] so
//! that [`StateStore::update`] can retry.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::config::StateBackendMode;
use crate::contracts::now_iso;

pub const SCHEMA_VERSION: u32 = 1;
const LOCK_WAIT: Duration = Duration::from_secs(3);
const CAS_RETRIES: u32 = 4;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("concurrent state update detected for namespace '{0}'")]
    Concurrency(String),
    #[error("timed out waiting for state lock")]
    LockTimeout,
    #[error("git: {0}")]
    Git(String),
    #[error("guardrail violation: {0}")]
    Guardrail(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type StateResult<T> = Result<T, StateError>;

/// The seven persisted namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Context,
    Tasks,
    Decisions,
    Checkpoints,
    Metrics,
    Runs,
    Leases,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::Context,
        Namespace::Tasks,
        Namespace::Decisions,
        Namespace::Checkpoints,
        Namespace::Metrics,
        Namespace::Runs,
        Namespace::Leases,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Tasks => "tasks",
            Self::Decisions => "decisions",
            Self::Checkpoints => "checkpoints",
            Self::Metrics => "metrics",
            Self::Runs => "runs",
            Self::Leases => "leases",
        }
    }
}

/// The persisted wrapper around every namespace payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub revision: u64,
    pub updated_at: String,
    pub data: Value,
}

/// RAII guard for the exclusive on-disk write lock.
struct StateLock {
    path: PathBuf,
}

impl StateLock {
    fn acquire(path: &Path) -> StateResult<Self> {
        let start = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > LOCK_WAIT {
                        return Err(StateError::LockTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct StateStore {
    repo_root: PathBuf,
    state_dir: PathBuf,
    anchor_file: PathBuf,
    lock_file: PathBuf,
    branch_ref: String,
    mode: StateBackendMode,
    git_available: bool,
}

impl StateStore {
    /// Open a store rooted at `repo_root`. Falls back to `local` mode when the
    /// directory is not inside a git worktree.
    pub fn open(
        repo_root: &Path,
        requested: StateBackendMode,
        branch_ref: &str,
    ) -> StateResult<Self> {
        let repo_root = repo_root
            .canonicalize()
            .unwrap_or_else(|_| repo_root.to_path_buf());
        let state_dir = repo_root.join(".architect").join("state");
        fs::create_dir_all(&state_dir)?;

        let git_available = is_git_worktree(&repo_root);
        let mode = if git_available {
            requested
        } else {
            StateBackendMode::Local
        };
        debug!(mode = %mode, git_available, "opened state store");

        Ok(Self {
            anchor_file: repo_root.join(".architect").join("anchor"),
            lock_file: state_dir.join(".lock"),
            state_dir,
            repo_root,
            branch_ref: branch_ref.to_string(),
            mode,
            git_available,
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn mode(&self) -> StateBackendMode {
        self.mode
    }

    pub fn git_enabled(&self) -> bool {
        self.git_available && self.mode != StateBackendMode::Local
    }

    // -- git plumbing -------------------------------------------------------

    fn run_git(&self, args: &[&str]) -> StateResult<String> {
        self.run_git_full(args, None, &[], true)
            .map(|(_, stdout, _)| stdout)
    }

    fn run_git_full(
        &self,
        args: &[&str],
        input: Option<&str>,
        envs: &[(&str, &str)],
        check: bool,
    ) -> StateResult<(i32, String, String)> {
        let mut command = Command::new("git");
        command
            .arg("--no-pager")
            .args(args)
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            command.env(key, value);
        }
        if input.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|err| StateError::Git(format!("failed to launch git: {err}")))?;
        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes())?;
            }
        }
        let output = child.wait_with_output()?;
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

    fn notes_ref(namespace: Namespace) -> String {
        format!("refs/notes/architect/{}", namespace.as_str())
    }

    fn state_branch_ref(&self) -> String {
        if self.branch_ref.starts_with("refs/") {
            self.branch_ref.clone()
        } else {
            format!("refs/heads/{}", self.branch_ref)
        }
    }

    fn state_branch_exists(&self) -> bool {
        self.run_git_full(
            &["show-ref", "--verify", "--quiet", &self.state_branch_ref()],
            None,
            &[],
            false,
        )
        .map(|(code, _, _)| code == 0)
        .unwrap_or(false)
    }

    /// The stable blob that commit-notes attach to. Hashed once and cached in
    /// a local anchor file so every process agrees on the object.
    fn anchor_object(&self) -> StateResult<String> {
        if !self.git_enabled() {
            return Ok("local-anchor".into());
        }
        if self.anchor_file.exists() {
            return Ok(fs::read_to_string(&self.anchor_file)?.trim().to_string());
        }
        let (_, anchor, _) = self.run_git_full(
            &["hash-object", "-w", "--stdin"],
            Some("architect-state-anchor\n"),
            &[],
            true,
        )?;
        if let Some(parent) = self.anchor_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.anchor_file, &anchor)?;
        Ok(anchor)
    }

    fn local_file(&self, namespace: Namespace) -> PathBuf {
        self.state_dir.join(format!("{}.json", namespace.as_str()))
    }

    fn read_branch_json(&self, namespace: Namespace) -> StateResult<Option<Value>> {
        let spec = format!("{}:{}.json", self.state_branch_ref(), namespace.as_str());
        let (code, stdout, _) = self.run_git_full(&["show", &spec], None, &[], false)?;
        if code != 0 || stdout.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&stdout).ok())
    }

    fn write_branch_json(&self, namespace: Namespace, serialized: &str) -> StateResult<()> {
        let git_ref = self.state_branch_ref();
        let mut parent_commit: Option<String> = None;
        let mut parent_tree: Option<String> = None;
        if self.state_branch_exists() {
            let commit = self.run_git(&["rev-parse", &git_ref])?;
            let tree = self.run_git(&["rev-parse", &format!("{commit}^{{tree}}")])?;
            parent_commit = Some(commit);
            parent_tree = Some(tree);
        }

        // Build the new tree through a throwaway index so the real index and
        // working tree are never touched.
        let index = tempfile::Builder::new()
            .prefix("architect-state-index-")
            .tempfile_in(&self.state_dir)?;
        let index_path = index.path().to_path_buf();
        drop(index);
        let index_str = index_path.to_string_lossy().to_string();
        let env: [(&str, &str); 1] = [("GIT_INDEX_FILE", index_str.as_str())];

        let result = (|| -> StateResult<()> {
            if let Some(tree) = &parent_tree {
                self.run_git_full(&["read-tree", tree], None, &env, true)?;
            }
            let (_, blob, _) = self.run_git_full(
                &["hash-object", "-w", "--stdin"],
                Some(serialized),
                &[],
                true,
            )?;
            let index_info = format!("100644 blob {blob}\t{}.json\n", namespace.as_str());
            self.run_git_full(
                &["update-index", "--index-info"],
                Some(&index_info),
                &env,
                true,
            )?;
            let (_, new_tree, _) = self.run_git_full(&["write-tree"], None, &env, true)?;
            let message = format!("architect-state: update {}\n", namespace.as_str());
            let (_, commit, _) = if let Some(parent) = &parent_commit {
                self.run_git_full(
                    &["commit-tree", &new_tree, "-p", parent],
                    Some(&message),
                    &[],
                    true,
                )?
            } else {
                self.run_git_full(&["commit-tree", &new_tree], Some(&message), &[], true)?
            };
            self.run_git_full(&["update-ref", &git_ref, &commit], None, &[], true)?;
            Ok(())
        })();

        let _ = fs::remove_file(&index_path);
        result
    }

    // -- raw reads and writes ----------------------------------------------

    fn read_raw(&self, namespace: Namespace) -> StateResult<Option<Value>> {
        if self.git_enabled() && self.mode == StateBackendMode::Notes {
            let anchor = self.anchor_object()?;
            let notes_ref = Self::notes_ref(namespace);
            let (code, stdout, _) = self.run_git_full(
                &["notes", "--ref", &notes_ref, "show", &anchor],
                None,
                &[],
                false,
            )?;
            if code != 0 || stdout.is_empty() {
                return Ok(None);
            }
            return Ok(serde_json::from_str(&stdout).ok());
        }
        if self.git_enabled() && self.mode == StateBackendMode::Branch {
            return self.read_branch_json(namespace);
        }

        let path = self.local_file(namespace);
        if !path.exists() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?).ok())
    }

    fn write_raw(&self, namespace: Namespace, payload: &Envelope) -> StateResult<()> {
        let serialized = serde_json::to_string(payload)?;
        if self.git_enabled() && self.mode == StateBackendMode::Notes {
            let anchor = self.anchor_object()?;
            let notes_ref = Self::notes_ref(namespace);
            self.run_git_full(
                &["notes", "--ref", &notes_ref, "add", "-f", "-m", &serialized, &anchor],
                None,
                &[],
                true,
            )?;
            return Ok(());
        }
        if self.git_enabled() && self.mode == StateBackendMode::Branch {
            return self.write_branch_json(namespace, &serialized);
        }
        fs::write(self.local_file(namespace), serialized)?;
        Ok(())
    }

    /// A payload missing the envelope keys is adopted as legacy data at
    /// revision 1, so older blobs are migrated transparently on first write.
    fn normalize(raw: Option<Value>, default: Value) -> Envelope {
        if let Some(Value::Object(map)) = &raw {
            if map.contains_key("schema_version")
                && map.contains_key("revision")
                && map.contains_key("data")
            {
                return Envelope {
                    schema_version: map
                        .get("schema_version")
                        .and_then(Value::as_u64)
                        .unwrap_or(SCHEMA_VERSION as u64) as u32,
                    revision: map.get("revision").and_then(Value::as_u64).unwrap_or(1),
                    updated_at: map
                        .get("updated_at")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(now_iso),
                    data: map.get("data").cloned().unwrap_or(default),
                };
            }
        }
        Envelope {
            schema_version: SCHEMA_VERSION,
            revision: 1,
            updated_at: now_iso(),
            data: raw.unwrap_or(default),
        }
    }

    // -- public API ---------------------------------------------------------

    pub fn envelope(&self, namespace: Namespace) -> StateResult<Envelope> {
        let raw = self.read_raw(namespace)?;
        Ok(Self::normalize(raw, Value::Object(Default::default())))
    }

    /// Typed view of a namespace payload. Payloads that fail to deserialize
    /// (older shapes, partial writes) fall back to `T::default()`, mirroring
    /// the adopt-on-read migration path.
    pub fn data<T>(&self, namespace: Namespace) -> StateResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let envelope = self.envelope(namespace)?;
        Ok(serde_json::from_value(envelope.data).unwrap_or_default())
    }

    /// Write `data`, bumping the revision. With `expected_revision`, the write
    /// fails if another writer got there first.
    pub fn set<T: Serialize>(
        &self,
        namespace: Namespace,
        data: &T,
        expected_revision: Option<u64>,
    ) -> StateResult<()> {
        let _lock = StateLock::acquire(&self.lock_file)?;
        let current = self.envelope(namespace)?;
        if let Some(expected) = expected_revision {
            if expected != current.revision {
                return Err(StateError::Concurrency(namespace.as_str().to_string()));
            }
        }
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            revision: current.revision + 1,
            updated_at: now_iso(),
            data: serde_json::to_value(data)?,
        };
        self.write_raw(namespace, &envelope)
    }

    /// Read-modify-write with up to four retries on CAS mismatch.
    pub fn update<T, F>(&self, namespace: Namespace, mut updater: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(T) -> T,
    {
        let mut last_error = None;
        for _ in 0..CAS_RETRIES {
            let envelope = self.envelope(namespace)?;
            let current: T = serde_json::from_value(envelope.data).unwrap_or_default();
            let updated = updater(current);
            match self.set(namespace, &updated, Some(envelope.revision)) {
                Ok(()) => return Ok(updated),
                Err(StateError::Concurrency(ns)) => {
                    last_error = Some(StateError::Concurrency(ns));
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| StateError::Other("state update failed".into())))
    }
}

fn is_git_worktree(path: &Path) -> bool {
    Command::new("git")
        .args(["--no-pager", "rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .stdin(Stdio::null())
        .output()
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
        .unwrap_or(false)
}
