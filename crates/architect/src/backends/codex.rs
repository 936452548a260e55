//! Codex CLI backend.
//!
//! Launches `codex exec --json -c instructions=<system prompt> [-m model]
//! <prompt>`. Emits fine-grained telemetry events for JSON partials, parse
//! fallbacks, and process exits through an optional hook.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use super::resilient::BackendEventHook;
use super::{appears_partial_json, extract_content, AgentBackend, BackendContext, BackendError};
use crate::contracts::tail_chars;

pub struct CodexBackend {
    binary: String,
    working_directory: Option<PathBuf>,
    event_hook: Option<BackendEventHook>,
}

impl CodexBackend {
    pub fn new(working_directory: Option<PathBuf>) -> Self {
        Self::with_binary("codex", working_directory)
    }

    pub fn with_binary(binary: impl Into<String>, working_directory: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            working_directory,
            event_hook: None,
        }
    }

    pub fn with_event_hook(mut self, hook: BackendEventHook) -> Self {
        self.event_hook = Some(hook);
        self
    }

    fn emit(&self, event: Value) {
        if let Some(hook) = &self.event_hook {
            hook(event);
        }
    }

    fn build_user_prompt(
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> String {
        let mut parts = vec![user_prompt.to_string()];
        if !context.is_empty() {
            parts.push("Context JSON:".into());
            parts.push(
                serde_json::to_string_pretty(&Value::Object(context.clone())).unwrap_or_default(),
            );
        }
        if let Some(tools) = tools {
            parts.push("Allowed tools:".into());
            parts.push(serde_json::to_string(tools).unwrap_or_default());
        }
        parts.join("\n\n")
    }

    fn build_command(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> Vec<String> {
        let rendered = Self::build_user_prompt(user_prompt, context, tools);
        let instructions = serde_json::to_string(system_prompt).unwrap_or_default();
        let mut command = vec![
            self.binary.clone(),
            "exec".into(),
            "--json".into(),
            "-c".into(),
            format!("instructions={instructions}"),
        ];
        if let Some(model) = context.get("model").and_then(Value::as_str) {
            let model = model.trim();
            if !model.is_empty() {
                command.push("-m".into());
                command.push(model.into());
            }
        }
        command.push(rendered);
        command
    }
}

#[async_trait]
impl AgentBackend for CodexBackend {
    fn name(&self) -> &str {
        "codex"
    }

    async fn execute(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> Result<Vec<String>, BackendError> {
        let command = self.build_command(system_prompt, user_prompt, context, tools);

        let cwd = context
            .get("_working_directory")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.working_directory.clone());

        self.emit(json!({
            "event": "codex_cli_start",
            "command": command.iter().take(4).collect::<Vec<_>>(),
            "has_context": !context.is_empty(),
            "tool_mode": tools.is_some(),
            "model": context.get("model").cloned().unwrap_or(Value::Null),
        }));

        let mut cmd = tokio::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|err| BackendError::Process {
            backend: "codex".into(),
            message: format!("Codex binary not found: {} ({err})", self.binary),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| BackendError::Process {
            backend: "codex".into(),
            message: "Codex backend did not expose stdout.".into(),
        })?;
        let mut stderr = child.stderr.take();

        let mut chunks = Vec::new();
        let mut buffer = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.map_err(|err| {
            BackendError::Execution {
                backend: "codex".into(),
                message: format!("failed reading stdout: {err}"),
                exit_code: None,
                retriable: true,
            }
        })? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let candidate = if buffer.is_empty() {
                line.clone()
            } else {
                format!("{buffer}{line}")
            };
            match serde_json::from_str::<Value>(&candidate) {
                Ok(event) => {
                    buffer.clear();
                    let content = extract_content(&event);
                    self.emit(json!({
                        "event": "codex_json_event",
                        "type": event.get("type").and_then(Value::as_str).unwrap_or(""),
                        "has_content": !content.is_empty(),
                    }));
                    if !content.is_empty() {
                        chunks.push(content);
                    }
                }
                Err(_) => {
                    if appears_partial_json(&candidate) {
                        self.emit(json!({
                            "event": "codex_json_partial",
                            "bytes": candidate.len(),
                        }));
                        buffer = candidate;
                    } else {
                        // Non-JSON noise on stdout is dropped, not surfaced.
                        buffer.clear();
                        self.emit(json!({
                            "event": "codex_json_parse_fallback",
                            "line": tail_chars(&line, 200),
                        }));
                    }
                }
            }
        }
        if !buffer.is_empty() {
            self.emit(json!({
                "event": "codex_json_buffer_flush",
                "bytes": buffer.len(),
            }));
        }

        let mut stderr_output = String::new();
        if let Some(pipe) = stderr.as_mut() {
            let _ = pipe.read_to_string(&mut stderr_output).await;
        }
        let status = child.wait().await.map_err(|err| BackendError::Process {
            backend: "codex".into(),
            message: format!("failed waiting for Codex process: {err}"),
        })?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            self.emit(json!({
                "event": "codex_cli_exit",
                "exit_code": code,
                "stderr": tail_chars(stderr_output.trim(), 400),
            }));
            return Err(BackendError::Execution {
                backend: "codex".into(),
                message: format!(
                    "Codex backend failed with exit code {code}: {}",
                    tail_chars(stderr_output.trim(), 400)
                ),
                exit_code: Some(code),
                retriable: true,
            });
        }
        self.emit(json!({"event": "codex_cli_exit", "exit_code": 0}));
        Ok(chunks)
    }
}
