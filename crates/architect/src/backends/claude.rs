//! Claude Code CLI backend.
//!
//! Launches `claude -p <prompt> --output-format stream-json` with the system
//! prompt handed over through a temp file referenced by `CLAUDE_MD`.

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use super::{reassemble_line, AgentBackend, BackendContext, BackendError};
use crate::contracts::tail_chars;

pub struct ClaudeBackend {
    binary: String,
    working_directory: Option<PathBuf>,
}

impl ClaudeBackend {
    pub fn new(working_directory: Option<PathBuf>) -> Self {
        Self::with_binary("claude", working_directory)
    }

    pub fn with_binary(binary: impl Into<String>, working_directory: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            working_directory,
        }
    }

    fn build_command(&self, user_prompt: &str) -> Vec<String> {
        vec![
            self.binary.clone(),
            "-p".into(),
            user_prompt.into(),
            "--output-format".into(),
            "stream-json".into(),
        ]
    }

    fn render_user_prompt(
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> String {
        let mut rendered = user_prompt.to_string();
        if !context.is_empty() {
            let context_json = serde_json::to_string_pretty(&Value::Object(context.clone()))
                .unwrap_or_default();
            rendered.push_str("\n\nContext JSON:\n");
            rendered.push_str(&context_json);
        }
        if let Some(tools) = tools {
            rendered.push_str("\n\nAllowed tools:\n");
            rendered.push_str(&serde_json::to_string(tools).unwrap_or_default());
        }
        rendered
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn execute(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> Result<Vec<String>, BackendError> {
        let rendered = Self::render_user_prompt(user_prompt, context, tools);
        let command = self.build_command(&rendered);

        // The system prompt travels through a temp file; keep the handle
        // alive until the subprocess exits.
        let mut prompt_file = tempfile::Builder::new()
            .prefix("architect-system-")
            .suffix(".md")
            .tempfile()
            .map_err(|err| BackendError::Process {
                backend: "claude".into(),
                message: format!("failed to create system prompt file: {err}"),
            })?;
        prompt_file
            .write_all(system_prompt.as_bytes())
            .map_err(|err| BackendError::Process {
                backend: "claude".into(),
                message: format!("failed to write system prompt file: {err}"),
            })?;

        let mut cmd = tokio::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .env("CLAUDE_MD", prompt_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|err| BackendError::Process {
            backend: "claude".into(),
            message: format!("Claude binary not found: {} ({err})", self.binary),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| BackendError::Process {
            backend: "claude".into(),
            message: "Claude backend did not expose stdout.".into(),
        })?;
        let mut stderr = child.stderr.take();

        let mut chunks = Vec::new();
        let mut buffer = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.map_err(|err| {
            BackendError::Execution {
                backend: "claude".into(),
                message: format!("failed reading stdout: {err}"),
                exit_code: None,
                retriable: true,
            }
        })? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Some(chunk) = reassemble_line(&mut buffer, &line, true) {
                chunks.push(chunk);
            }
        }
        if !buffer.is_empty() {
            chunks.push(buffer);
        }

        let mut stderr_output = String::new();
        if let Some(pipe) = stderr.as_mut() {
            let _ = pipe.read_to_string(&mut stderr_output).await;
        }
        let status = child.wait().await.map_err(|err| BackendError::Process {
            backend: "claude".into(),
            message: format!("failed waiting for Claude process: {err}"),
        })?;
        debug!(exit = ?status.code(), chunks = chunks.len(), "claude backend finished");

        if !status.success() {
            return Err(BackendError::Execution {
                backend: "claude".into(),
                message: format!(
                    "Claude backend failed with exit code {}: {}",
                    status.code().unwrap_or(-1),
                    tail_chars(stderr_output.trim(), 400)
                ),
                exit_code: status.code(),
                retriable: true,
            });
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_shape() {
        let backend = ClaudeBackend::new(None);
        let command = backend.build_command("fix the bug");
        assert_eq!(
            command,
            vec!["claude", "-p", "fix the bug", "--output-format", "stream-json"]
        );
    }

    #[test]
    fn prompt_rendering_appends_context_and_tools() {
        let mut context = BackendContext::new();
        context.insert("goal".into(), serde_json::json!("ship it"));
        let tools = vec!["read_file".to_string()];
        let rendered = ClaudeBackend::render_user_prompt("do", &context, Some(&tools));
        assert!(rendered.starts_with("do"));
        assert!(rendered.contains("Context JSON:"));
        assert!(rendered.contains("ship it"));
        assert!(rendered.contains("Allowed tools:"));
        assert!(rendered.contains("read_file"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_process_error() {
        let backend = ClaudeBackend::with_binary("definitely-not-a-real-binary-xyz", None);
        let err = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Process { .. }));
        assert!(!err.is_retriable());
    }
}
