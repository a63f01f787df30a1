// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Rule-routed mock model provider for end-to-end tests and offline demos.
///
/// The provider maps input patterns to canned responses (text only, or a
/// tool-call batch followed by a final text reply).  Because routing keys on
/// the **last user message** rather than call order, many tasks can share
/// one provider concurrently and still get deterministic behaviour — which
/// is exactly what scheduler fan-out tests need.
///
/// Rules can be built in code or loaded from YAML
/// (`provider: mock` + `mock_responses_file` / `NORN_MOCK_RESPONSES`):
///
/// ```yaml
/// responses:
///   - match_type: contains       # contains | equals | starts_with | regex | default
///     pattern: "ping"
///     reply: "pong"
///
///   - match_type: contains
///     pattern: "weather"
///     tool_calls:
///       - id: tc-1
///         tool: get_current_weather
///         args:
///           location: Boston
///     after_tool_reply: "30°C in Boston."
///
///   - match_type: default
///     reply: "I understand your request."
/// ```
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AssistantReply, CompletionRequest, Role, ToolCallRequest};

// ─── Rule schema ─────────────────────────────────────────────────────────────

/// Root document.
#[derive(Debug, Default, Deserialize)]
pub struct MockRules {
    pub responses: Vec<ResponseRule>,
}

/// One entry in the responses list.
#[derive(Debug, Deserialize)]
pub struct ResponseRule {
    /// How to match the last user message.
    pub match_type: MatchType,
    /// Pattern string (ignored for `default` match type).
    #[serde(default)]
    pub pattern: String,
    /// Simple text reply (used when there are no tool_calls).
    pub reply: Option<String>,
    /// Tool calls to emit in the first round.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDef>,
    /// Text reply to send after tool results arrive (second round).
    pub after_tool_reply: Option<String>,
    /// Fail the completion call with this transport error instead of
    /// replying.  Lets tests exercise model-failure paths per input.
    pub transport_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    Equals,
    StartsWith,
    Regex,
    Default,
}

/// A single tool call defined in a rule.
#[derive(Debug, Deserialize)]
pub struct ToolCallDef {
    pub id: String,
    pub tool: String,
    /// Map that is serialized to a JSON string for the tool arguments.
    pub args: serde_json::Value,
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// A model provider whose responses are driven by match rules.
pub struct RoutedMockProvider {
    rules: Arc<MockRules>,
    name: String,
}

impl RoutedMockProvider {
    pub fn new(rules: MockRules) -> Self {
        Self {
            rules: Arc::new(rules),
            name: "routed-mock".into(),
        }
    }

    /// Load a provider from a YAML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading mock responses file: {}", path.display()))?;
        Self::load(&text)
    }

    /// Load a provider from a YAML string.
    pub fn load(yaml: &str) -> anyhow::Result<Self> {
        let rules: MockRules =
            serde_yaml::from_str(yaml).context("parsing mock responses YAML")?;
        Ok(Self::new(rules))
    }

    fn find_rule<'a>(&'a self, user_text: &str) -> Option<&'a ResponseRule> {
        let lower = user_text.to_lowercase();
        let mut default_rule = None;

        for rule in &self.rules.responses {
            match rule.match_type {
                MatchType::Default => {
                    default_rule = Some(rule);
                }
                MatchType::Contains => {
                    if lower.contains(&rule.pattern.to_lowercase()) {
                        return Some(rule);
                    }
                }
                MatchType::Equals => {
                    if lower == rule.pattern.to_lowercase() {
                        return Some(rule);
                    }
                }
                MatchType::StartsWith => {
                    if lower.starts_with(&rule.pattern.to_lowercase()) {
                        return Some(rule);
                    }
                }
                MatchType::Regex => {
                    if let Ok(re) = regex::Regex::new(&rule.pattern) {
                        if re.is_match(user_text) {
                            return Some(rule);
                        }
                    }
                }
            }
        }

        default_rule
    }
}

#[async_trait]
impl crate::ModelProvider for RoutedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "routed-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<AssistantReply> {
        // Determine whether we are responding after tool results were added.
        let has_tool_results = req.messages.iter().any(|m| m.role == Role::Tool);

        // Find the last user message – this is the key we match against.
        let last_user_text = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no user message]")
            .to_string();

        debug!(has_tool_results, last_user = %last_user_text, "routed mock complete()");

        let rule = self.find_rule(&last_user_text);

        if let Some(error) = rule.and_then(|r| r.transport_error.as_deref()) {
            anyhow::bail!("{error}");
        }

        let reply = if has_tool_results {
            // Round 2: tool results are in – respond with after_tool_reply or reply
            let text = rule
                .and_then(|r| r.after_tool_reply.as_deref().or(r.reply.as_deref()))
                .unwrap_or("[no after-tool reply configured]");
            AssistantReply::text(text)
        } else {
            match rule {
                None => AssistantReply::text("[no mock rule matched]"),
                Some(r) if r.tool_calls.is_empty() => {
                    let text = r.reply.as_deref().unwrap_or("[no reply configured]");
                    AssistantReply::text(text)
                }
                Some(r) => AssistantReply::calls(
                    r.tool_calls
                        .iter()
                        .map(|tc| ToolCallRequest::new(&tc.id, &tc.tool, tc.args.to_string()))
                        .collect(),
                ),
            }
        };

        Ok(reply)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
