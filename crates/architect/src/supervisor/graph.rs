//! Task graph construction and readiness.
//!
//! The graph starts as a single plan task. Once the planner's output is in,
//! implementation steps are chunked by `max_patches_before_review`; each chunk
//! is gated by a test task and (optionally) a review task, and the gate ids
//! thread through so chunk N+1 cannot start before chunk N's gate passes. A
//! final document task depends on the last gate.

use crate::contracts::{TaskStatus, TaskType, WorkTask};
use crate::state_store::{Namespace, StateStore};

pub const PLAN_TASK_ID: &str = "task-plan-001";

pub fn plan_task(goal: &str) -> WorkTask {
    WorkTask::new(
        PLAN_TASK_ID,
        TaskType::Plan,
        format!("Design a technical approach for: {goal}"),
    )
}

/// Indices of pending tasks whose dependencies are all completed, in queue
/// order.
pub fn ready_tasks(tasks: &[WorkTask]) -> Vec<usize> {
    let completed: std::collections::HashSet<&str> = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .map(|task| task.id.as_str())
        .collect();
    tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.status == TaskStatus::Pending)
        .filter(|(_, task)| {
            task.depends_on
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
        })
        .map(|(index, _)| index)
        .collect()
}

/// Build the full task graph from extracted plan steps.
///
/// `modify_tasks` (user-requested patch amendments carried over from a prior
/// session) are prepended to the implementation set.
pub fn create_task_graph(
    goal: &str,
    plan_steps: &[String],
    modify_tasks: Vec<WorkTask>,
    max_patches_before_review: usize,
    require_critic_approval: bool,
) -> Vec<WorkTask> {
    let mut tasks = vec![plan_task(goal)];

    let mut implementation: Vec<WorkTask> = modify_tasks;
    let steps: Vec<String> = if plan_steps.is_empty() {
        vec![format!("Implement the approved plan for: {goal}")]
    } else {
        plan_steps.to_vec()
    };
    for (index, step) in steps.iter().enumerate() {
        implementation.push(WorkTask::new(
            format!("task-implement-{:03}", index + 1),
            TaskType::Implement,
            format!("Implement step {}: {step}", index + 1),
        ));
    }

    let max_chunk = max_patches_before_review.max(1);
    let mut previous_gate_id = PLAN_TASK_ID.to_string();
    let mut remaining = implementation.into_iter().peekable();
    let mut chunk_number = 0usize;
    while remaining.peek().is_some() {
        let chunk: Vec<WorkTask> = remaining.by_ref().take(max_chunk).collect();
        chunk_number += 1;
        let mut implement_ids = Vec::new();
        for mut task in chunk {
            task.depends_on = vec![previous_gate_id.clone()];
            implement_ids.push(task.id.clone());
            tasks.push(task);
        }

        let test_task_id = format!("task-test-{chunk_number:03}");
        tasks.push(
            WorkTask::new(
                test_task_id.clone(),
                TaskType::Test,
                format!("Test implementation chunk {chunk_number} for: {goal}"),
            )
            .with_deps(implement_ids),
        );

        if require_critic_approval {
            let review_task_id = format!("task-review-{chunk_number:03}");
            tasks.push(
                WorkTask::new(
                    review_task_id.clone(),
                    TaskType::Review,
                    format!("Review implementation chunk {chunk_number} for: {goal}"),
                )
                .with_deps(vec![test_task_id]),
            );
            previous_gate_id = review_task_id;
        } else {
            previous_gate_id = test_task_id;
        }
    }

    tasks.push(
        WorkTask::new(
            "task-document-001",
            TaskType::Document,
            format!("Document final changes for: {goal}"),
        )
        .with_deps(vec![previous_gate_id]),
    );
    tasks
}

/// Load pending `task-modify-*` tasks queued by the `modify` workflow and
/// reset them for execution under the new plan.
pub fn load_pending_modify_tasks(store: &StateStore) -> Vec<WorkTask> {
    let payload: crate::contracts::TasksPayload =
        store.data(Namespace::Tasks).unwrap_or_default();
    payload
        .task_queue
        .into_iter()
        .filter(|task| task.id.starts_with("task-modify-"))
        .filter(|task| {
            matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Failed
            )
        })
        .map(|mut task| {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.completed_at = None;
            task.failure_reason = None;
            task.assigned_to = TaskType::Implement.specialist_role().to_string();
            task.depends_on = vec![PLAN_TASK_ID.to_string()];
            task
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("step {i}")).collect()
    }

    #[test]
    fn single_chunk_graph_shape() {
        let tasks = create_task_graph("goal", &steps(2), Vec::new(), 5, true);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "task-plan-001",
                "task-implement-001",
                "task-implement-002",
                "task-test-001",
                "task-review-001",
                "task-document-001",
            ]
        );
        // Implements depend on the plan; test on implements; review on test;
        // document on the review gate.
        assert_eq!(tasks[1].depends_on, vec!["task-plan-001"]);
        assert_eq!(
            tasks[3].depends_on,
            vec!["task-implement-001", "task-implement-002"]
        );
        assert_eq!(tasks[4].depends_on, vec!["task-test-001"]);
        assert_eq!(tasks[5].depends_on, vec!["task-review-001"]);
    }

    #[test]
    fn chunk_gates_thread_through() {
        let tasks = create_task_graph("goal", &steps(3), Vec::new(), 2, true);
        // Chunk 2's implement must wait for chunk 1's review gate.
        let implement_3 = tasks.iter().find(|t| t.id == "task-implement-003").unwrap();
        assert_eq!(implement_3.depends_on, vec!["task-review-001"]);
        let document = tasks.iter().find(|t| t.id == "task-document-001").unwrap();
        assert_eq!(document.depends_on, vec!["task-review-002"]);
    }

    #[test]
    fn no_critic_chains_on_test_gates() {
        let tasks = create_task_graph("goal", &steps(3), Vec::new(), 2, false);
        assert!(!tasks.iter().any(|t| t.task_type == TaskType::Review));
        let implement_3 = tasks.iter().find(|t| t.id == "task-implement-003").unwrap();
        assert_eq!(implement_3.depends_on, vec!["task-test-001"]);
    }

    #[test]
    fn empty_steps_get_a_synthetic_one() {
        let tasks = create_task_graph("ship it", &[], Vec::new(), 5, true);
        let implement = tasks.iter().find(|t| t.id == "task-implement-001").unwrap();
        assert!(implement.description.contains("approved plan"));
    }

    #[test]
    fn modify_tasks_are_prepended() {
        let modify = vec![WorkTask::new(
            "task-modify-abcd1234",
            TaskType::Implement,
            "Amend patch",
        )];
        let tasks = create_task_graph("goal", &steps(1), modify, 5, true);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let modify_pos = ids.iter().position(|id| *id == "task-modify-abcd1234").unwrap();
        let implement_pos = ids.iter().position(|id| *id == "task-implement-001").unwrap();
        assert!(modify_pos < implement_pos);
    }

    #[test]
    fn readiness_honors_dependencies() {
        let mut tasks = create_task_graph("goal", &steps(1), Vec::new(), 5, true);
        // Only the plan is ready at first.
        assert_eq!(ready_tasks(&tasks), vec![0]);
        tasks[0].status = TaskStatus::Completed;
        let ready = ready_tasks(&tasks);
        assert_eq!(ready.len(), 1);
        assert_eq!(tasks[ready[0]].id, "task-implement-001");
        // A failed dependency never unblocks dependents.
        tasks[1].status = TaskStatus::Failed;
        assert!(ready_tasks(&tasks).is_empty());
    }

    #[test]
    fn parallel_ready_implements_within_a_chunk() {
        let mut tasks = create_task_graph("goal", &steps(3), Vec::new(), 5, true);
        tasks[0].status = TaskStatus::Completed;
        let ready = ready_tasks(&tasks);
        assert_eq!(ready.len(), 3);
    }
}
