// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-task agent coroutine.
//!
//! Runs one leaf task as a pausable producer of tool-call batches: each
//! [`AgentCoroutine::step`] issues one model call; a reply carrying tool
//! calls suspends the coroutine until the scheduler hands the ordered
//! results back via [`AgentCoroutine::on_tool_results`]; a plain assistant
//! reply is the task's final result.  The scheduler owns one coroutine per
//! running task and parks it while the task is suspended.

use tracing::debug;

use norn_model::{CompletionRequest, Message, ModelProvider, ToolCallRequest, ToolSchema};

use crate::error::PayloadError;
use crate::task::TaskPayload;

/// What one step of the coroutine produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// The model requested these tool calls; the coroutine is suspended
    /// until their results are appended.
    ToolCalls(Vec<ToolCallRequest>),
    /// The model produced a final assistant message; the task is done.
    Final(String),
}

pub struct AgentCoroutine {
    conversation: Vec<Message>,
    pending_tool_calls: Vec<ToolCallRequest>,
}

impl AgentCoroutine {
    /// Build the initial message list from the task payload:
    /// `messages` are used verbatim, a `prompt` becomes one user turn, and
    /// a `tool_name`/`parameters` pair becomes a user turn instructing the
    /// model to call that tool.
    pub fn new(payload: &TaskPayload) -> Result<Self, PayloadError> {
        let conversation = match payload {
            TaskPayload::Messages { messages } => {
                if messages.is_empty() {
                    return Err(PayloadError::EmptyMessages);
                }
                messages.clone()
            }
            TaskPayload::Prompt { prompt } => vec![Message::user(prompt)],
            TaskPayload::Tool { tool_name, parameters } => {
                let params = serde_json::to_string_pretty(parameters)
                    .unwrap_or_else(|_| "{}".into());
                vec![Message::user(format!(
                    "Execute the following tool call precisely as specified:\n\n\
                     Tool: `{tool_name}`\nParameters: {params}"
                ))]
            }
            TaskPayload::Other(_) => return Err(PayloadError::Invalid),
        };
        Ok(Self { conversation, pending_tool_calls: Vec::new() })
    }

    /// Issue one model call.
    ///
    /// When the reply carries tool calls, the assistant tool-call turns are
    /// appended to the conversation here — before any results exist — so
    /// the history always satisfies the wire ordering (request turns
    /// strictly precede their result messages).
    pub async fn step(
        &mut self,
        model: &dyn ModelProvider,
        tools: &[ToolSchema],
    ) -> anyhow::Result<StepOutcome> {
        debug_assert!(
            self.pending_tool_calls.is_empty(),
            "step() called while suspended on tool results"
        );

        let req = CompletionRequest {
            messages: self.conversation.clone(),
            tools: tools.to_vec(),
            ..Default::default()
        };
        let reply = model.complete(req).await?;

        if reply.has_tool_calls() {
            debug!(count = reply.tool_calls.len(), "model requested tool calls");
            for tc in &reply.tool_calls {
                self.conversation
                    .push(Message::tool_call(&tc.id, tc.function.clone()));
            }
            self.pending_tool_calls = reply.tool_calls.clone();
            Ok(StepOutcome::ToolCalls(reply.tool_calls))
        } else {
            Ok(StepOutcome::Final(reply.content.unwrap_or_default()))
        }
    }

    /// Resume after a suspension: append the tool-result messages and mark
    /// the coroutine ready to step again.
    ///
    /// Results are matched back into request order by `tool_call_id` so a
    /// misordered batch still yields a well-formed conversation; unmatched
    /// messages are appended at the end.
    pub fn on_tool_results(&mut self, mut results: Vec<Message>) {
        for tc in &self.pending_tool_calls {
            if let Some(pos) = results
                .iter()
                .position(|m| m.tool_call_id() == Some(tc.id.as_str()))
            {
                self.conversation.push(results.remove(pos));
            }
        }
        self.conversation.append(&mut results);
        self.pending_tool_calls.clear();
    }

    /// True while the coroutine waits for tool results.
    pub fn is_suspended(&self) -> bool {
        !self.pending_tool_calls.is_empty()
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
