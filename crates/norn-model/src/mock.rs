// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{AssistantReply, CompletionRequest, Role, ToolCallRequest};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<AssistantReply> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        Ok(AssistantReply::text(format!("MOCK: {reply}")))
    }
}

/// One scripted turn for [`ScriptedMockProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this assistant reply.
    Reply(AssistantReply),
    /// Fail the completion call with this transport error message.
    TransportError(String),
}

impl ScriptedReply {
    /// A plain text assistant reply.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Reply(AssistantReply::text(content))
    }

    /// A reply carrying a single tool-call request.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::Reply(AssistantReply::calls(vec![ToolCallRequest::new(
            id, name, arguments,
        )]))
    }

    /// A reply carrying a batch of tool-call requests.
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self::Reply(AssistantReply::calls(calls))
    }

    /// A simulated transport failure.
    pub fn error(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// script from the front of the queue.  This lets tests specify exact reply
/// sequences — including tool-call batches and transport errors — without
/// network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<ScriptedReply>>>,
    name: String,
    /// Every `CompletionRequest` seen by this provider, in call order.
    /// Written on each `complete()` call so tests can inspect what was sent.
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from an ordered list of scripted turns.
    pub fn new(scripts: Vec<ScriptedReply>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: provider whose first call returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedReply::text(reply)])
    }

    /// Convenience: provider that returns a tool call, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedReply::tool_call(tool_id, tool_name, args_json),
            ScriptedReply::text(final_text),
        ])
    }

    /// Number of `complete()` calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// All requests seen so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Shared handle to the request log, for tests that move the provider
    /// into a scheduler but still need to inspect traffic afterwards.
    pub fn request_log(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<AssistantReply> {
        self.requests.lock().unwrap().push(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                ScriptedReply::text("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        match script {
            ScriptedReply::Reply(reply) => Ok(reply),
            ScriptedReply::TransportError(msg) => anyhow::bail!(msg),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
