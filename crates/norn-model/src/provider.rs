// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{AssistantReply, CompletionRequest};

/// A chat-completions backend.
///
/// One completion call per `complete` invocation; the returned
/// [`AssistantReply`] carries either final text or a batch of tool-call
/// requests.  Implementations must be callable from many tasks at once.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider id for status display and logs.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the assistant's reply.
    ///
    /// Transport failures (network, auth, timeout, malformed body) surface
    /// as errors; the caller decides how they map onto task state.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<AssistantReply>;
}
