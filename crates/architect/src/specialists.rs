//! Specialist agents: thin role wrappers over the backend dispatcher.
//!
//! A specialist carries a role name, a system prompt, and an optional model
//! override passed through the call context. Tool access is normalized
//! against a fixed allow-list; unknown tool names are rejected outright.

use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::backends::{AgentBackend, BackendContext, BackendError};
use crate::config::AgentsConfig;
use crate::prompts;

/// The only tools a specialist may ever be granted.
pub const TOOL_POLICY_ALLOWLIST: [&str; 5] = [
    "read_file",
    "write_file",
    "edit_file",
    "run_command",
    "search",
];

#[derive(Debug, Error)]
pub enum SpecialistError {
    #[error("tool policy rejected unknown tools for specialist run: {0}")]
    ToolPolicy(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct SpecialistResponse {
    pub role: String,
    pub content: String,
    pub metadata: Value,
}

pub struct Specialist {
    role: String,
    system_prompt: String,
    model: Option<String>,
    backend: Arc<dyn AgentBackend>,
}

impl Specialist {
    pub fn new(
        role: impl Into<String>,
        backend: Arc<dyn AgentBackend>,
        model: Option<String>,
        repo_root: &Path,
    ) -> Self {
        let role = role.into();
        let system_prompt = load_system_prompt(repo_root, &role);
        Self {
            role,
            system_prompt,
            model,
            backend,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Sorted, deduplicated tool list; errors on any name outside the
    /// allow-list. `None` when the input is empty or absent.
    fn normalize_allowed_tools(
        allowed_tools: Option<&[String]>,
    ) -> Result<Option<Vec<String>>, SpecialistError> {
        let Some(tools) = allowed_tools else {
            return Ok(None);
        };
        let normalized: BTreeSet<String> = tools
            .iter()
            .map(|tool| tool.trim().to_string())
            .filter(|tool| !tool.is_empty())
            .collect();
        if normalized.is_empty() {
            return Ok(None);
        }
        let unknown: Vec<String> = normalized
            .iter()
            .filter(|tool| !TOOL_POLICY_ALLOWLIST.contains(&tool.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(SpecialistError::ToolPolicy(unknown.join(", ")));
        }
        Ok(Some(normalized.into_iter().collect()))
    }

    /// Dispatch an instruction. In tool mode the call streams with the
    /// normalized tool list and the full context (so model and working
    /// directory overrides survive); the collected text is the response.
    pub async fn run(
        &self,
        instruction: &str,
        context: BackendContext,
        allowed_tools: Option<&[String]>,
    ) -> Result<SpecialistResponse, SpecialistError> {
        let mut run_context = context;
        if let Some(model) = &self.model {
            run_context.insert("model".into(), Value::String(model.clone()));
        }
        let normalized = Self::normalize_allowed_tools(allowed_tools)?;
        debug!(role = %self.role, tool_mode = normalized.is_some(), "dispatching specialist");

        if let Some(tools) = normalized {
            let chunks = self
                .backend
                .execute(&self.system_prompt, instruction, &run_context, Some(&tools))
                .await?;
            return Ok(SpecialistResponse {
                role: self.role.clone(),
                content: chunks.concat().trim().to_string(),
                metadata: json!({
                    "instruction": instruction,
                    "tool_mode": true,
                    "allowed_tools": tools,
                    "tool_policy_enforced": true,
                }),
            });
        }

        let chunks = self
            .backend
            .execute(&self.system_prompt, instruction, &run_context, None)
            .await?;
        Ok(SpecialistResponse {
            role: self.role.clone(),
            content: chunks.concat().trim().to_string(),
            metadata: json!({
                "instruction": instruction,
                "tool_mode": false,
            }),
        })
    }
}

fn load_system_prompt(repo_root: &Path, role: &str) -> String {
    let override_path = repo_root
        .join(".architect")
        .join("prompts")
        .join(format!("{role}.md"));
    match std::fs::read_to_string(&override_path) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => prompts::default_prompt(role).trim().to_string(),
    }
}

/// The wired specialist team plus the optional supervisor decomposition
/// agent.
pub struct SpecialistSet {
    pub specialists: HashMap<String, Specialist>,
    pub supervisor: Option<Specialist>,
}

impl SpecialistSet {
    pub fn build(
        backend: Arc<dyn AgentBackend>,
        agents: &AgentsConfig,
        repo_root: &Path,
    ) -> Self {
        let mut specialists = HashMap::new();
        for role in ["planner", "coder", "tester", "critic", "documenter"] {
            specialists.insert(
                role.to_string(),
                Specialist::new(
                    role,
                    backend.clone(),
                    Some(agents.specialist_model.clone()),
                    repo_root,
                ),
            );
        }
        let supervisor = Specialist::new(
            "supervisor",
            backend,
            Some(agents.supervisor_model.clone()),
            repo_root,
        );
        Self {
            specialists,
            supervisor: Some(supervisor),
        }
    }
}
