//! Agent backend transport layer.
//!
//! A backend launches an external agent CLI as a subprocess, decodes its
//! stdout as JSON-Lines events, and returns the extracted text chunks. The
//! [`resilient::ResilientBackend`] wrapper adds timeout, bounded retry, and
//! primary→fallback failover on top of two concrete leaves.

pub mod claude;
pub mod codex;
pub mod resilient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use claude::ClaudeBackend;
pub use codex::CodexBackend;
pub use resilient::{BackendEventHook, ResilientBackend, RetryPolicy};

/// Free-form call context forwarded to the backend (goal, task snapshot,
/// model override, `_working_directory`, ...).
pub type BackendContext = Map<String, Value>;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The subprocess could not be launched or exposed no stdout. Never
    /// retried on the same backend; fails over immediately.
    #[error("backend process error [{backend}]: {message}")]
    Process { backend: String, message: String },

    /// The subprocess ran but failed (non-zero exit, transport-level parse
    /// failure). Retriable unless flagged otherwise.
    #[error("backend execution failed [{backend}]: {message}")]
    Execution {
        backend: String,
        message: String,
        exit_code: Option<i32>,
        retriable: bool,
    },

    /// The per-call wall clock was exceeded. Retriable.
    #[error("backend request timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },
}

impl BackendError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Process { .. } => false,
            Self::Execution { retriable, .. } => *retriable,
            Self::Timeout { .. } => true,
        }
    }

    pub fn backend_name(&self) -> Option<&str> {
        match self {
            Self::Process { backend, .. } | Self::Execution { backend, .. } => Some(backend),
            Self::Timeout { .. } => None,
        }
    }
}

/// Structured payload returned by tool-mode execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub backend: String,
    pub content: String,
    pub allowed_tools: Vec<String>,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Stable name used in telemetry and error messages.
    fn name(&self) -> &str;

    /// Run the agent and return the collected text chunks. Chunks are
    /// buffered within the attempt; callers must not assume incremental
    /// streaming across a failover boundary.
    async fn execute(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> Result<Vec<String>, BackendError>;

    /// Tool-mode entry point. The default collects `execute` under a
    /// `tool_mode` context; the resilient wrapper overrides this so tool
    /// calls get the same retry and failover treatment.
    async fn execute_with_tools(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        allowed_tools: &[String],
    ) -> Result<ToolExecution, BackendError> {
        let mut context = BackendContext::new();
        context.insert("tool_mode".into(), Value::Bool(true));
        let chunks = self
            .execute(system_prompt, user_prompt, &context, Some(allowed_tools))
            .await?;
        Ok(ToolExecution {
            backend: self.name().to_string(),
            content: chunks.concat().trim().to_string(),
            allowed_tools: allowed_tools.to_vec(),
        })
    }
}

/// Whether an accumulated buffer looks like a partial JSON record
/// (unbalanced braces or brackets), in which case the next line is appended
/// before parsing is retried.
pub(crate) fn appears_partial_json(raw: &str) -> bool {
    let mut braces = 0i64;
    let mut brackets = 0i64;
    for ch in raw.chars() {
        match ch {
            '{' => braces += 1,
            '}' => braces -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }
    }
    braces > 0 || brackets > 0
}

/// Extract visible text from a decoded event, probing `content` (string or
/// list of `{text}` items), then `delta`, then `message` (string or
/// `{content}`).
pub(crate) fn extract_content(event: &Value) -> String {
    match event.get("content") {
        Some(Value::String(text)) => return text.clone(),
        Some(Value::Array(items)) => {
            let mut parts = String::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    parts.push_str(text);
                }
            }
            if !parts.is_empty() {
                return parts;
            }
        }
        _ => {}
    }
    if let Some(delta) = event.get("delta").and_then(Value::as_str) {
        return delta.to_string();
    }
    match event.get("message") {
        Some(Value::String(text)) => return text.clone(),
        Some(Value::Object(message)) => {
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                return text.to_string();
            }
        }
        _ => {}
    }
    String::new()
}

/// Feed one stdout line through the reassembly buffer.
///
/// Returns the chunk to emit, if any. Raw (non-JSON, non-partial) lines are
/// passed through as text when `emit_raw` is set, otherwise dropped.
pub(crate) fn reassemble_line(
    buffer: &mut String,
    line: &str,
    emit_raw: bool,
) -> Option<String> {
    let candidate = if buffer.is_empty() {
        line.to_string()
    } else {
        format!("{buffer}{line}")
    };
    match serde_json::from_str::<Value>(&candidate) {
        Ok(event) => {
            buffer.clear();
            let content = extract_content(&event);
            if content.is_empty() {
                None
            } else {
                Some(content)
            }
        }
        Err(_) => {
            if appears_partial_json(&candidate) {
                *buffer = candidate;
                None
            } else {
                buffer.clear();
                if emit_raw {
                    Some(line.to_string())
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_content_string() {
        assert_eq!(extract_content(&json!({"content": "hello"})), "hello");
    }

    #[test]
    fn extracts_content_blocks() {
        let event = json!({"content": [{"text": "a"}, {"text": "b"}, {"other": 1}]});
        assert_eq!(extract_content(&event), "ab");
    }

    #[test]
    fn extracts_delta_and_message() {
        assert_eq!(extract_content(&json!({"delta": "d"})), "d");
        assert_eq!(extract_content(&json!({"message": "m"})), "m");
        assert_eq!(
            extract_content(&json!({"message": {"content": "inner"}})),
            "inner"
        );
        assert_eq!(extract_content(&json!({"type": "noise"})), "");
    }

    #[test]
    fn partial_json_detection() {
        assert!(appears_partial_json(r#"{"content": "unfinished"#));
        assert!(appears_partial_json(r#"[1, 2"#));
        assert!(!appears_partial_json("plain text"));
        assert!(!appears_partial_json(r#"{"done": true}"#));
    }

    #[test]
    fn reassembles_split_records() {
        let mut buffer = String::new();
        assert_eq!(reassemble_line(&mut buffer, r#"{"content": "sp"#, true), None);
        assert!(!buffer.is_empty());
        let chunk = reassemble_line(&mut buffer, r#"lit"}"#, true);
        assert_eq!(chunk.as_deref(), Some("split"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn raw_lines_pass_through_when_enabled() {
        let mut buffer = String::new();
        assert_eq!(
            reassemble_line(&mut buffer, "not json at all", true).as_deref(),
            Some("not json at all")
        );
        assert_eq!(reassemble_line(&mut buffer, "not json at all", false), None);
    }

    #[test]
    fn timeout_and_process_errors_classify() {
        assert!(BackendError::Timeout { seconds: 1.0 }.is_retriable());
        assert!(!BackendError::Process {
            backend: "claude".into(),
            message: "binary not found".into()
        }
        .is_retriable());
        assert!(BackendError::Execution {
            backend: "codex".into(),
            message: "exit 1".into(),
            exit_code: Some(1),
            retriable: true,
        }
        .is_retriable());
    }
}
