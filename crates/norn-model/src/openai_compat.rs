// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared implementation for OpenAI-compatible chat completion APIs.
//!
//! Every HTTP-backed driver in the registry speaks the same
//! `/chat/completions` wire format; this module provides a single
//! `OpenAICompatProvider` that each driver configures with its own defaults
//! (URL, auth style).  Responses are read as one non-streaming completion —
//! the scheduler consumes whole assistant turns, never token deltas.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (hosted providers)
//! - `None` — no authentication (local servers like Ollama / LM Studio)

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    AssistantReply, CompletionRequest, Message, MessageContent, ToolCallRequest, ToolChoice,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for hosted providers.
    Bearer,
    /// No authentication header — local servers.
    None,
}

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    /// Provider id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `https://api.groq.com/openai/v1/chat/completions`.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    auth_style: AuthStyle,
}

impl OpenAICompatProvider {
    /// Construct a provider from its endpoint and auth configuration.
    ///
    /// # Parameters
    /// - `driver_name` — stable id from the registry (e.g. `"groq"`)
    /// - `model` — model identifier forwarded to the API
    /// - `api_key` — pre-resolved key (may be `None` for local servers)
    /// - `base_url` — API base that ends **before** `/chat/completions`
    /// - `max_tokens` — `None` defaults to 4096
    /// - `temperature` — `None` defaults to 0.2
    /// - `timeout` — whole-request timeout for each completion call
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        timeout: Duration,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            auth_style,
        }
    }

    /// Assemble the JSON request body for one completion call.
    fn build_request_body(&self, req: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_openai_messages(&req.messages),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            let choice = req.tool_choice.unwrap_or(ToolChoice::Auto);
            body["tool_choice"] = json!(choice);
        }
        if let Some(rf) = &req.response_format {
            body["response_format"] = json!(rf);
        }
        body
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<AssistantReply> {
        let body = self.build_request_body(&req);

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        http_req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                http_req.bearer_auth(key)
            }
            AuthStyle::None => http_req,
        };

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .with_context(|| format!("{} returned a malformed completion body", self.driver_name))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .with_context(|| format!("{} returned no choices", self.driver_name))?;

        Ok(AssistantReply {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }
}

// ─── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireAssistantMessage,
}

#[derive(Debug, Deserialize)]
struct WireAssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallRequest>>,
}

/// Serialize conversation messages into the OpenAI wire shape.
///
/// Assistant tool-call turns become `{"role": "assistant", "tool_calls":
/// [...]}` (one call per message; consecutive calls from one batch each get
/// their own entry, which OpenAI-compatible servers accept), and tool
/// results become `{"role": "tool", "tool_call_id", "name", "content"}`.
pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(t) => json!({
                "role": m.role,
                "content": t,
            }),
            MessageContent::ToolCall { tool_call_id, function } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }],
            }),
            MessageContent::ToolResult { tool_call_id, name, content } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "name": name,
                "content": content,
            }),
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionCall, ResponseFormat, ToolSchema};

    fn provider() -> OpenAICompatProvider {
        OpenAICompatProvider::new(
            "openai",
            "gpt-4o".into(),
            Some("sk-test".into()),
            "https://api.openai.com/v1/",
            Some(1024),
            Some(0.0),
            Duration::from_secs(120),
            AuthStyle::Bearer,
        )
    }

    #[test]
    fn chat_url_strips_trailing_slash() {
        let p = provider();
        assert_eq!(p.chat_url, "https://api.openai.com/v1/chat/completions");
    }

    // ── Message serialization ─────────────────────────────────────────────────

    #[test]
    fn text_message_maps_role_and_content() {
        let wire = build_openai_messages(&[Message::user("hi")]);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"], "hi");
    }

    #[test]
    fn tool_call_message_wraps_in_tool_calls_array() {
        let m = Message::tool_call(
            "tc-1",
            FunctionCall { name: "get_current_weather".into(), arguments: r#"{"location":"Boston"}"#.into() },
        );
        let wire = build_openai_messages(&[m]);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[0]["tool_calls"][0]["id"], "tc-1");
        assert_eq!(wire[0]["tool_calls"][0]["type"], "function");
        assert_eq!(
            wire[0]["tool_calls"][0]["function"]["name"],
            "get_current_weather"
        );
    }

    #[test]
    fn tool_result_message_carries_id_name_content() {
        let m = Message::tool_result("tc-1", "get_current_weather", r#"{"temp":30}"#);
        let wire = build_openai_messages(&[m]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "tc-1");
        assert_eq!(wire[0]["name"], "get_current_weather");
        assert_eq!(wire[0]["content"], r#"{"temp":30}"#);
    }

    // ── Request body ──────────────────────────────────────────────────────────

    #[test]
    fn body_without_tools_omits_tool_fields() {
        let body = provider().build_request_body(&CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        });
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn body_with_tools_sets_auto_choice() {
        let body = provider().build_request_body(&CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![ToolSchema {
                name: "t".into(),
                description: "d".into(),
                parameters: json!({ "type": "object" }),
            }],
            ..Default::default()
        });
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "t");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn body_forwards_json_response_format() {
        let body = provider().build_request_body(&CompletionRequest {
            messages: vec![Message::user("plan")],
            response_format: Some(ResponseFormat::JsonObject),
            ..Default::default()
        });
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    // ── Response parsing ──────────────────────────────────────────────────────

    #[test]
    fn wire_response_with_tool_calls_parses() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "c1", "type": "function",
                         "function": {"name": "f", "arguments": "{}"}}
                    ]
                }
            }]
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let msg = &parsed.choices[0].message;
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.as_ref().unwrap()[0].id, "c1");
    }

    #[test]
    fn wire_response_with_text_parses() {
        let raw = r#"{"choices": [{"message": {"role": "assistant", "content": "hi"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hi"));
    }
}
