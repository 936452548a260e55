//! Primary→fallback failover wrapper with timeout and bounded retry.
//!
//! Each attempt collects the full chunk list under the per-call timeout; only
//! a successful attempt's chunks reach the caller, so a failover never splices
//! partial output from two backends.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentBackend, BackendContext, BackendError, ToolExecution};
use crate::contracts::tail_chars;

/// Receives structured telemetry events (`backend_retry`,
/// `backend_attempt_failed`, `backend_fallback_success`, ...).
pub type BackendEventHook = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_seconds: f64,
    pub timeout_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_seconds: 0.5,
            timeout_seconds: 90.0,
        }
    }
}

enum Call<'a> {
    Execute {
        context: &'a BackendContext,
        tools: Option<&'a [String]>,
    },
    Tools {
        allowed: &'a [String],
    },
}

impl Call<'_> {
    fn name(&self) -> &'static str {
        match self {
            Call::Execute { .. } => "execute",
            Call::Tools { .. } => "execute_with_tools",
        }
    }
}

pub struct ResilientBackend {
    primary_name: String,
    primary: Box<dyn AgentBackend>,
    fallback_name: String,
    fallback: Box<dyn AgentBackend>,
    policy: RetryPolicy,
    event_hook: Option<BackendEventHook>,
}

impl ResilientBackend {
    pub fn new(
        primary_name: impl Into<String>,
        primary: Box<dyn AgentBackend>,
        fallback_name: impl Into<String>,
        fallback: Box<dyn AgentBackend>,
        policy: RetryPolicy,
        event_hook: Option<BackendEventHook>,
    ) -> Self {
        Self {
            primary_name: primary_name.into(),
            primary,
            fallback_name: fallback_name.into(),
            fallback,
            policy,
            event_hook,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn emit(&self, event: Value) {
        if let Some(hook) = &self.event_hook {
            hook(event);
        }
    }

    async fn timed_collect(
        &self,
        backend: &dyn AgentBackend,
        system_prompt: &str,
        user_prompt: &str,
        call: &Call<'_>,
    ) -> Result<Vec<String>, BackendError> {
        let attempt = async {
            match call {
                Call::Execute { context, tools } => {
                    backend
                        .execute(system_prompt, user_prompt, context, *tools)
                        .await
                }
                Call::Tools { allowed } => {
                    let mut context = BackendContext::new();
                    context.insert("tool_mode".into(), Value::Bool(true));
                    backend
                        .execute(system_prompt, user_prompt, &context, Some(allowed))
                        .await
                }
            }
        };
        let deadline = Duration::from_secs_f64(self.policy.timeout_seconds.max(0.001));
        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                seconds: self.policy.timeout_seconds,
            }),
        }
    }

    async fn execute_attempts(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        call: Call<'_>,
    ) -> Result<Vec<String>, BackendError> {
        let call_name = call.name();
        let mut backends: Vec<(&str, &dyn AgentBackend)> =
            vec![(self.primary_name.as_str(), self.primary.as_ref())];
        if self.fallback_name != self.primary_name {
            backends.push((self.fallback_name.as_str(), self.fallback.as_ref()));
        }

        let mut errors: Vec<String> = Vec::new();
        for (backend_name, backend) in backends {
            for attempt in 0..=self.policy.max_retries {
                if attempt > 0 {
                    let delay = self.policy.backoff_seconds * f64::from(1u32 << (attempt - 1));
                    self.emit(json!({
                        "event": "backend_retry",
                        "backend": backend_name,
                        "attempt": attempt,
                        "delay_seconds": delay,
                        "call": call_name,
                    }));
                    tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
                }
                match self
                    .timed_collect(backend, system_prompt, user_prompt, &call)
                    .await
                {
                    Ok(chunks) => {
                        if backend_name != self.primary_name {
                            self.emit(json!({
                                "event": "backend_fallback_success",
                                "backend": backend_name,
                                "attempt": attempt,
                                "call": call_name,
                            }));
                        }
                        return Ok(chunks);
                    }
                    Err(err) => {
                        let retriable = err.is_retriable();
                        errors.push(format!("{backend_name}[{attempt}]: {err}"));
                        self.emit(json!({
                            "event": "backend_attempt_failed",
                            "backend": backend_name,
                            "attempt": attempt,
                            "call": call_name,
                            "error": tail_chars(&err.to_string(), 400),
                            "retriable": retriable,
                        }));
                        if !retriable {
                            break;
                        }
                    }
                }
            }
        }

        let summary = errors
            .iter()
            .rev()
            .take(6)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        Err(BackendError::Execution {
            backend: "resilient".into(),
            message: format!("All backend attempts failed for {call_name}. {summary}"),
            exit_code: None,
            retriable: false,
        })
    }
}

#[async_trait]
impl AgentBackend for ResilientBackend {
    fn name(&self) -> &str {
        "resilient"
    }

    async fn execute(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        context: &BackendContext,
        tools: Option<&[String]>,
    ) -> Result<Vec<String>, BackendError> {
        self.execute_attempts(system_prompt, user_prompt, Call::Execute { context, tools })
            .await
    }

    async fn execute_with_tools(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        allowed_tools: &[String],
    ) -> Result<ToolExecution, BackendError> {
        let chunks = self
            .execute_attempts(
                system_prompt,
                user_prompt,
                Call::Tools {
                    allowed: allowed_tools,
                },
            )
            .await?;
        Ok(ToolExecution {
            backend: "resilient".into(),
            content: chunks.concat().trim().to_string(),
            allowed_tools: allowed_tools.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend scripted to fail `failures` times, then yield `output`.
    struct Scripted {
        name: String,
        failures: AtomicU32,
        output: Vec<String>,
        retriable: bool,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &str, failures: u32, output: &[&str]) -> Self {
            Self {
                name: name.into(),
                failures: AtomicU32::new(failures),
                output: output.iter().map(|s| s.to_string()).collect(),
                retriable: true,
                calls: AtomicU32::new(0),
            }
        }

        fn non_retriable(mut self) -> Self {
            self.retriable = false;
            self
        }
    }

    #[async_trait]
    impl AgentBackend for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _context: &BackendContext,
            _tools: Option<&[String]>,
        ) -> Result<Vec<String>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                if self.retriable {
                    return Err(BackendError::Execution {
                        backend: self.name.clone(),
                        message: "scripted failure".into(),
                        exit_code: Some(1),
                        retriable: true,
                    });
                }
                return Err(BackendError::Process {
                    backend: self.name.clone(),
                    message: "binary not found".into(),
                });
            }
            Ok(self.output.clone())
        }
    }

    fn capture_hook() -> (BackendEventHook, Arc<Mutex<Vec<Value>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let hook: BackendEventHook = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (hook, events)
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_seconds: 0.0,
            timeout_seconds: 5.0,
        }
    }

    #[tokio::test]
    async fn primary_success_needs_no_events() {
        let (hook, events) = capture_hook();
        let backend = ResilientBackend::new(
            "claude",
            Box::new(Scripted::new("claude", 0, &["ok"])),
            "codex",
            Box::new(Scripted::new("codex", 0, &["never"])),
            fast_policy(1),
            Some(hook),
        );
        let chunks = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap();
        assert_eq!(chunks, vec!["ok"]);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_primary_then_falls_back() {
        let (hook, events) = capture_hook();
        let backend = ResilientBackend::new(
            "claude",
            Box::new(Scripted::new("claude", 10, &[])),
            "codex",
            Box::new(Scripted::new("codex", 0, &["ok"])),
            fast_policy(1),
            Some(hook),
        );
        let chunks = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap();
        assert_eq!(chunks, vec!["ok"]);

        let events = events.lock().unwrap();
        let retries: Vec<&Value> = events
            .iter()
            .filter(|e| e["event"] == "backend_retry")
            .collect();
        // max_retries = 1 → exactly one retry of the primary before failover.
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0]["backend"], "claude");
        let fallback_pos = events
            .iter()
            .position(|e| e["event"] == "backend_fallback_success")
            .expect("fallback success event");
        let last_retry_pos = events
            .iter()
            .rposition(|e| e["event"] == "backend_retry" && e["backend"] == "claude")
            .unwrap();
        assert!(last_retry_pos < fallback_pos);
    }

    #[tokio::test]
    async fn non_retriable_error_skips_remaining_primary_attempts() {
        let (hook, events) = capture_hook();
        let backend = ResilientBackend::new(
            "claude",
            Box::new(Scripted::new("claude", 10, &[]).non_retriable()),
            "codex",
            Box::new(Scripted::new("codex", 0, &["ok"])),
            fast_policy(3),
            Some(hook),
        );
        let chunks = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap();
        assert_eq!(chunks, vec!["ok"]);
        let events = events.lock().unwrap();
        // No primary retries: the process error broke straight to fallback.
        assert!(!events
            .iter()
            .any(|e| e["event"] == "backend_retry" && e["backend"] == "claude"));
    }

    #[tokio::test]
    async fn identical_names_disable_failover() {
        let backend = ResilientBackend::new(
            "claude",
            Box::new(Scripted::new("claude", 10, &[])),
            "claude",
            Box::new(Scripted::new("claude", 0, &["never"])),
            fast_policy(1),
            None,
        );
        let err = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("All backend attempts failed"));
    }

    #[tokio::test]
    async fn terminal_error_includes_attempt_summaries() {
        let backend = ResilientBackend::new(
            "claude",
            Box::new(Scripted::new("claude", 10, &[])),
            "codex",
            Box::new(Scripted::new("codex", 10, &[])),
            fast_policy(1),
            None,
        );
        let err = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("claude[0]"));
        assert!(message.contains("codex[1]"));
    }

    #[tokio::test]
    async fn timeout_is_retriable_and_consumes_budget() {
        struct Sleeper;
        #[async_trait]
        impl AgentBackend for Sleeper {
            fn name(&self) -> &str {
                "sleeper"
            }
            async fn execute(
                &self,
                _s: &str,
                _u: &str,
                _c: &BackendContext,
                _t: Option<&[String]>,
            ) -> Result<Vec<String>, BackendError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(vec![])
            }
        }

        let backend = ResilientBackend::new(
            "sleeper",
            Box::new(Sleeper),
            "codex",
            Box::new(Scripted::new("codex", 0, &["ok"])),
            RetryPolicy {
                max_retries: 0,
                backoff_seconds: 0.0,
                timeout_seconds: 0.05,
            },
            None,
        );
        let chunks = backend
            .execute("sys", "user", &BackendContext::new(), None)
            .await
            .unwrap();
        assert_eq!(chunks, vec!["ok"]);
    }

    #[tokio::test]
    async fn tool_mode_routes_through_retry_machinery() {
        let (hook, events) = capture_hook();
        let backend = ResilientBackend::new(
            "claude",
            Box::new(Scripted::new("claude", 1, &["tool ", "output"])),
            "codex",
            Box::new(Scripted::new("codex", 0, &["never"])),
            fast_policy(2),
            Some(hook),
        );
        let tools = vec!["read_file".to_string()];
        let payload = backend
            .execute_with_tools("sys", "user", &tools)
            .await
            .unwrap();
        assert_eq!(payload.content, "tool output");
        assert_eq!(payload.backend, "resilient");
        assert_eq!(payload.allowed_tools, tools);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e["event"] == "backend_retry" && e["call"] == "execute_with_tools"));
    }
}
