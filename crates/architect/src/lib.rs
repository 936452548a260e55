//! Architect: a supervisor-driven team of LLM coding specialists.
//!
//! A central [`supervisor::Supervisor`] decomposes a goal into a
//! dependency-ordered task graph, dispatches each task to a specialist backed
//! by an external agent CLI (with primary→fallback failover), promotes task
//! output into version-controlled patches, and enforces quality gates before
//! advancing. Durable state lives in a namespaced, optimistically-concurrent
//! [`state_store::StateStore`] so runs can pause, resume, roll back, and be
//! audited.

pub mod backends;
pub mod config;
pub mod contracts;
pub mod events;
pub mod patch_stack;
pub mod paths;
pub mod prompts;
pub mod specialists;
pub mod state_store;
pub mod supervisor;

pub use config::ArchitectConfig;
pub use contracts::{RunSummary, TaskStatus, TaskType, WorkTask};
pub use patch_stack::{Patch, PatchStack, PatchStatus};
pub use specialists::{Specialist, SpecialistSet};
pub use state_store::{Namespace, StateStore};
pub use supervisor::Supervisor;
