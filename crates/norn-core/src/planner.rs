// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Goal decomposition.
//!
//! The planner is a specialised agent that issues exactly one plain
//! completion in JSON-output mode and never emits tool calls itself.  The
//! model's reply is parsed into a [`Plan`]; a plan that fails validation
//! fails the originating planning task without creating any subtasks.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use norn_model::{CompletionRequest, Message, ModelProvider, ResponseFormat, ToolSchema};

use crate::error::PlanError;
use crate::task::{TaskPayload, TaskType};

/// A validated decomposition of a planning goal.
#[derive(Debug, Deserialize)]
pub struct Plan {
    pub subtasks: Vec<SubtaskSpec>,
}

/// One subtask as described by the model.  Dependencies reference sibling
/// subtasks by name; the graph resolves them to ids at link time.
#[derive(Debug, Deserialize)]
pub struct SubtaskSpec {
    pub name: String,
    pub task_type: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SubtaskSpec {
    /// Map the model-supplied type string onto [`TaskType`].
    ///
    /// Nested `planning` subtasks are accepted: the scheduler decomposes
    /// them recursively like any other planning task.
    pub fn task_type(&self) -> Result<TaskType, PlanError> {
        match self.task_type.to_lowercase().as_str() {
            "tool_call" => Ok(TaskType::ToolCall),
            "final_summary" => Ok(TaskType::FinalSummary),
            "reasoning" => Ok(TaskType::Reasoning),
            "planning" => Ok(TaskType::Planning),
            other => Err(PlanError::InvalidTaskType(other.to_string())),
        }
    }
}

pub struct Planner {
    model: Arc<dyn ModelProvider>,
}

impl Planner {
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self { model }
    }

    /// Decompose `goal` into a plan of subtasks, given the tool catalogue.
    ///
    /// One model call with `response_format = json_object`; the reply is
    /// validated and normalised before anything reaches the task graph.
    pub async fn decompose(
        &self,
        goal: &str,
        catalogue: &[ToolSchema],
    ) -> Result<Plan, PlanError> {
        let system = planning_system_prompt(catalogue);
        let req = CompletionRequest {
            messages: vec![Message::system(system), Message::user(goal)],
            response_format: Some(ResponseFormat::JsonObject),
            ..Default::default()
        };

        let reply = self.model.complete(req).await.map_err(PlanError::Model)?;
        let raw = reply.content.ok_or(PlanError::EmptyResponse)?;
        debug!(bytes = raw.len(), "planner reply received");

        let mut plan: Plan = serde_json::from_str(strip_code_fences(&raw))?;
        validate_and_normalise(&mut plan)?;
        info!(subtasks = plan.subtasks.len(), "plan accepted");
        Ok(plan)
    }
}

/// Validate the plan shape and wire the summary's implicit dependencies.
///
/// Exactly one `final_summary` subtask is required; every other subtask is
/// added to its dependency list even when the model omitted those edges, so
/// the summary always runs last with every sibling result available.
fn validate_and_normalise(plan: &mut Plan) -> Result<(), PlanError> {
    if plan.subtasks.is_empty() {
        return Err(PlanError::EmptyPlan);
    }
    for spec in &plan.subtasks {
        spec.task_type()?;
    }

    let summary_indices: Vec<usize> = plan
        .subtasks
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s.task_type(), Ok(TaskType::FinalSummary)))
        .map(|(i, _)| i)
        .collect();

    let summary_idx = match summary_indices.as_slice() {
        [] => return Err(PlanError::MissingFinalSummary),
        [one] => *one,
        many => return Err(PlanError::MultipleFinalSummaries(many.len())),
    };

    let other_names: Vec<String> = plan
        .subtasks
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != summary_idx)
        .map(|(_, s)| s.name.clone())
        .collect();

    let summary = &mut plan.subtasks[summary_idx];
    for name in other_names {
        if !summary.dependencies.contains(&name) {
            summary.dependencies.push(name);
        }
    }
    Ok(())
}

/// Strip a Markdown code fence wrapper from a model reply, if present.
/// Models wrap JSON in ``` fences even when JSON mode is requested.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language tag on the fence line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest)
}

fn planning_system_prompt(catalogue: &[ToolSchema]) -> String {
    let tools_json = serde_json::to_string_pretty(
        &catalogue
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".into());

    format!(
        r#"You are a planner. Decompose the user's request into a structured plan of subtasks that a machine can execute. Respond with a single valid JSON object and nothing else.

The JSON object has one key, "subtasks": a list of objects, each with:
- "name": (string) unique, descriptive, snake_case (e.g. "get_weather_for_guangzhou"). Names are how dependencies refer to each other.
- "task_type": (string) one of:
    - "tool_call": executes one tool.
    - "reasoning": free-form text work, no specific tool.
    - "final_summary": synthesises the final answer. There must be exactly ONE such subtask and it must depend on every other subtask.
- "payload": (object)
    - for "tool_call": {{"tool_name": string, "parameters": object}}
    - for "reasoning" and "final_summary": {{"prompt": string}} (the final_summary prompt may be empty; it is filled in from the other subtasks' results at run time)
- "dependencies": (list of strings) names of subtasks that must complete first.

Available tools:
{tools_json}

Independent subtasks should not depend on each other, so they can run concurrently. When generating tool parameters, prefer concise, localised keywords in the native language of the place in question (e.g. '广州 美食' rather than 'authentic local food in Guangzhou').

Example of a valid response:
{{
  "subtasks": [
    {{
      "name": "get_guangzhou_weather",
      "task_type": "tool_call",
      "payload": {{"tool_name": "get_current_weather", "parameters": {{"location": "Guangzhou"}}}},
      "dependencies": []
    }},
    {{
      "name": "summarise_and_report",
      "task_type": "final_summary",
      "payload": {{"prompt": ""}},
      "dependencies": ["get_guangzhou_weather"]
    }}
  ]
}}"#
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
