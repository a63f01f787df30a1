// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory task graph.
//!
//! Purely a data structure: all mutation happens under the scheduler's
//! single lock, and none of the operations here perform I/O.  Dependency
//! references arrive from the planner as sibling *names* and are resolved
//! exactly once, in [`TaskGraph::link`]; afterwards the hot-path operations
//! work on [`TaskId`]s and reverse edges only.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::task::{Task, TaskId, TaskSnapshot, TaskStatus, TaskType};

#[derive(Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, detecting duplicate ids.
    pub fn add(&mut self, task: Task) -> Result<TaskId, GraphError> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateId(task.id));
        }
        let id = task.id;
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Atomically attach `subtasks` (paired with their name-based dependency
    /// lists) under `parent`.
    ///
    /// Validates the whole sibling set — unique names, resolvable dependency
    /// names, acyclicity — before inserting anything, so a rejected plan
    /// leaves the graph untouched.  Returns the ids of subtasks that are
    /// immediately ready (no dependencies), in insertion order.
    pub fn link(
        &mut self,
        parent: TaskId,
        subtasks: Vec<(Task, Vec<String>)>,
    ) -> Result<Vec<TaskId>, GraphError> {
        if !self.tasks.contains_key(&parent) {
            return Err(GraphError::UnknownTask(parent));
        }

        // Resolve names within the new sibling set.
        let mut by_name: HashMap<&str, TaskId> = HashMap::new();
        for (task, _) in &subtasks {
            if self.tasks.contains_key(&task.id) {
                return Err(GraphError::DuplicateId(task.id));
            }
            if by_name.insert(task.name.as_str(), task.id).is_some() {
                return Err(GraphError::DuplicateName(task.name.clone()));
            }
        }

        let mut resolved: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (task, dep_names) in &subtasks {
            let mut deps = Vec::with_capacity(dep_names.len());
            for dep in dep_names {
                match by_name.get(dep.as_str()) {
                    Some(id) => deps.push(*id),
                    None => {
                        return Err(GraphError::UnknownDependency {
                            subtask: task.name.clone(),
                            dependency: dep.clone(),
                        })
                    }
                }
            }
            resolved.insert(task.id, deps);
        }

        check_acyclic(&subtasks, &resolved)?;

        // Validation passed; mutate.
        let mut ready = Vec::new();
        let mut summary = None;
        let sibling_ids: Vec<TaskId> = subtasks.iter().map(|(t, _)| t.id).collect();

        for (mut task, _) in subtasks {
            let deps = resolved.remove(&task.id).unwrap_or_default();
            task.parent = Some(parent);
            task.waiting_for_dependencies = deps.iter().copied().collect();
            task.dependencies = deps;
            if task.task_type == TaskType::FinalSummary {
                summary = Some(task.id);
            }
            if task.is_ready() {
                ready.push(task.id);
            }
            self.tasks.insert(task.id, task);
        }

        // Reverse edges for O(|dependents|) resolution later.
        for id in &sibling_ids {
            let deps = self.tasks[id].dependencies.clone();
            for dep in deps {
                if let Some(dep_task) = self.tasks.get_mut(&dep) {
                    dep_task.dependents.push(*id);
                }
            }
        }

        let parent_task = self
            .tasks
            .get_mut(&parent)
            .ok_or(GraphError::UnknownTask(parent))?;
        parent_task.subtasks = sibling_ids.clone();
        parent_task.waiting_for_subtasks = sibling_ids.into_iter().collect();
        parent_task.summary_subtask = summary;

        Ok(ready)
    }

    /// Remove `finished` from each dependent's waiting set and return the
    /// dependents whose waiting set just became empty (and are still queued).
    pub fn resolve_dependency(&mut self, finished: TaskId) -> Vec<TaskId> {
        let dependents = match self.tasks.get(&finished) {
            Some(t) => t.dependents.clone(),
            None => return Vec::new(),
        };
        let mut now_ready = Vec::new();
        for dep_id in dependents {
            if let Some(dependent) = self.tasks.get_mut(&dep_id) {
                let was_waiting = dependent.waiting_for_dependencies.remove(&finished);
                if was_waiting && dependent.is_ready() {
                    now_ready.push(dep_id);
                }
            }
        }
        now_ready
    }

    /// Remove `finished` from its parent's waiting set and return the parent
    /// id iff that set just became empty.
    pub fn mark_parent_progress(&mut self, finished: TaskId) -> Option<TaskId> {
        let parent_id = self.tasks.get(&finished)?.parent?;
        let parent = self.tasks.get_mut(&parent_id)?;
        let was_waiting = parent.waiting_for_subtasks.remove(&finished);
        if was_waiting && parent.waiting_for_subtasks.is_empty() {
            Some(parent_id)
        } else {
            None
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(&id).map(Task::snapshot)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Count tasks currently in `status`.
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Ids of all non-terminal tasks (used to preempt on shutdown).
    pub fn non_terminal_ids(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect()
    }
}

/// Kahn's algorithm over the new sibling set; reports the names stuck in a
/// cycle when one exists.
fn check_acyclic(
    subtasks: &[(Task, Vec<String>)],
    resolved: &HashMap<TaskId, Vec<TaskId>>,
) -> Result<(), GraphError> {
    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
    let mut edges: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

    for (task, _) in subtasks {
        let deps = &resolved[&task.id];
        in_degree.insert(task.id, deps.len());
        for dep in deps {
            edges.entry(*dep).or_default().push(task.id);
        }
    }

    let mut queue: Vec<TaskId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited: HashSet<TaskId> = HashSet::new();

    while let Some(id) = queue.pop() {
        visited.insert(id);
        if let Some(nexts) = edges.get(&id) {
            for next in nexts.clone() {
                let d = in_degree.get_mut(&next).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push(next);
                }
            }
        }
    }

    if visited.len() == subtasks.len() {
        Ok(())
    } else {
        let mut stuck: Vec<String> = subtasks
            .iter()
            .filter(|(t, _)| !visited.contains(&t.id))
            .map(|(t, _)| t.name.clone())
            .collect();
        stuck.sort();
        Err(GraphError::DependencyCycle(stuck))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
