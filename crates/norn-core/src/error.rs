// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Structural violations detected while mutating the task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate task id: {0}")]
    DuplicateId(crate::task::TaskId),
    #[error("unknown task id: {0}")]
    UnknownTask(crate::task::TaskId),
    #[error("duplicate subtask name: {0:?}")]
    DuplicateName(String),
    #[error("subtask {subtask:?} depends on unknown sibling {dependency:?}")]
    UnknownDependency { subtask: String, dependency: String },
    #[error("dependency cycle among subtasks: {0:?}")]
    DependencyCycle(Vec<String>),
}

/// Reasons a plan is rejected before any subtask is created.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner model call failed: {0}")]
    Model(#[from] anyhow::Error),
    #[error("planner returned no content")]
    EmptyResponse,
    #[error("plan is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("plan contains no subtasks")]
    EmptyPlan,
    #[error("plan is missing a final_summary subtask")]
    MissingFinalSummary,
    #[error("plan contains {0} final_summary subtasks, expected exactly one")]
    MultipleFinalSummaries(usize),
    #[error("plan subtask has invalid task_type {0:?}")]
    InvalidTaskType(String),
}

/// Leaf payloads that cannot be turned into a conversation.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid payload: expected one of 'messages', 'prompt', or 'tool_name'")]
    Invalid,
    #[error("invalid payload: 'messages' must not be empty")]
    EmptyMessages,
}

/// Failures surfaced by [`crate::Scheduler::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("scheduler is not running")]
    NotRunning,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
