// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool dispatch: model-emitted tool-call request → tool-result message.
//!
//! The dispatcher never returns an error.  Unknown tools, malformed
//! argument JSON, and tool failures are all captured into the result
//! message's content as `{"error": "<description>"}`, so the agent
//! coroutine is always resumable and the model can react to the failure
//! in-conversation.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use norn_model::{Message, ToolCallRequest, ToolSchema};
use norn_tools::{ToolCall, ToolRegistry};

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// The tool catalogue in the wire shape sent to the model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    /// Execute one tool call and package the outcome as a tool-result
    /// message of shape `{tool_call_id, role: "tool", name, content}`.
    pub async fn invoke(&self, call: &ToolCallRequest) -> Message {
        let name = &call.function.name;
        let raw_args = call.function.arguments.trim();

        // Models occasionally send an empty arguments string for zero-arg
        // calls; substitute {} rather than failing the parse.
        let args = if raw_args.is_empty() {
            json!({})
        } else {
            match serde_json::from_str(raw_args) {
                Ok(v) => v,
                Err(e) => {
                    warn!(tool = %name, call_id = %call.id, error = %e,
                        "tool call carried invalid JSON arguments");
                    return self.error_message(call, format!("invalid tool arguments: {e}"));
                }
            }
        };

        debug!(tool = %name, call_id = %call.id, "dispatching tool call");
        let output = self
            .registry
            .execute(&ToolCall { id: call.id.clone(), name: name.clone(), args })
            .await;

        if output.is_error {
            warn!(tool = %name, call_id = %call.id, "tool returned an error");
            self.error_message(call, output.content)
        } else {
            Message::tool_result(&call.id, name, output.content)
        }
    }

    fn error_message(&self, call: &ToolCallRequest, description: String) -> Message {
        Message::tool_result(
            &call.id,
            &call.function.name,
            json!({ "error": description }).to_string(),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
