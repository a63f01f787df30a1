// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use norn_model::Message;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Must be decomposed by the planner before it can run.
    Planning,
    /// Leaf that drives the model with a payload naming one tool and its
    /// arguments.
    ToolCall,
    /// Leaf whose prompt is synthesised at admission time from the results
    /// of its dependencies.
    FinalSummary,
    /// Leaf that drives the model with a free-form prompt and may or may
    /// not invoke tools.
    Reasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingForTool,
    WaitingForSubtasks,
    Completed,
    Failed,
    Preempted,
}

impl TaskStatus {
    /// Terminal states never change again; neither does `result`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Structured task input.
///
/// Client-submitted payloads arrive as free-form JSON; the untagged enum
/// accepts the three recognised shapes and everything else falls into
/// `Other`, which fails the task at admission rather than at parse time so
/// the submitter still gets a task id to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    Messages {
        messages: Vec<Message>,
    },
    Tool {
        tool_name: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    Prompt {
        prompt: String,
    },
    Other(serde_json::Value),
}

impl TaskPayload {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::Prompt { prompt: text.into() }
    }

    /// The goal text of a planning payload, when it has one.
    pub fn goal(&self) -> Option<&str> {
        match self {
            Self::Prompt { prompt } => Some(prompt),
            _ => None,
        }
    }
}

/// A node in the execution graph.
///
/// Reference bookkeeping (`dependencies` / `dependents` / `subtasks`) is by
/// `TaskId`; name-based dependency references from the planner are resolved
/// once, at link time.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Terminal output: final text, synthesised summary, or failure text.
    /// Written exactly once, on the terminal transition.
    pub result: Option<String>,
    pub parent: Option<TaskId>,
    /// Advisory only; never consulted for admission order.
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    /// Dependencies not yet completed.  A task is ready when this is empty.
    pub waiting_for_dependencies: HashSet<TaskId>,
    /// Reverse dependency edges, resolved at link time.
    pub dependents: Vec<TaskId>,
    pub subtasks: Vec<TaskId>,
    /// Subtasks not yet terminal.  The parent closes when this empties.
    pub waiting_for_subtasks: HashSet<TaskId>,
    /// The designated final-summary subtask of a planning task, if any.
    pub summary_subtask: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, payload: TaskPayload, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type,
            payload,
            status: TaskStatus::Queued,
            result: None,
            parent: None,
            priority: 0,
            dependencies: Vec::new(),
            waiting_for_dependencies: HashSet::new(),
            dependents: Vec::new(),
            subtasks: Vec::new(),
            waiting_for_subtasks: HashSet::new(),
            summary_subtask: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// A task is ready to run if it's not waiting on any dependencies.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Queued && self.waiting_for_dependencies.is_empty()
    }

    /// Record admission into RUNNING.  The first admission stamps
    /// `started_at`; re-admission after a tool round does not.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = TaskStatus::Running;
    }

    /// Terminal success.  No-op if the task is already terminal.
    pub fn complete(&mut self, result: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
    }

    /// Terminal failure.  No-op if the task is already terminal.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Failed;
        self.result = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Leave a non-terminal task in PREEMPTED (scheduler shutdown).
    pub fn preempt(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Preempted;
        }
    }

    /// Seconds between creation and first admission, if started.
    pub fn wait_time(&self) -> Option<f64> {
        self.started_at
            .map(|s| (s - self.created_at).num_milliseconds() as f64 / 1000.0)
    }

    /// Seconds between first admission and the terminal transition.
    pub fn execution_time(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Serializable read view for the HTTP layer and CLI.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            task_type: self.task_type,
            status: self.status,
            payload: self.payload.clone(),
            result: self.result.clone(),
            parent: self.parent,
            priority: self.priority,
            dependencies: self.dependencies.clone(),
            subtasks: self.subtasks.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            wait_time: self.wait_time(),
            execution_time: self.execution_time(),
        }
    }
}

/// Point-in-time view of a task, taken under the scheduler lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub result: Option<String>,
    pub parent: Option<TaskId>,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub subtasks: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub wait_time: Option<f64>,
    pub execution_time: Option<f64>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
