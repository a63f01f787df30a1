// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Built-in demo tool: current weather for a named location.
///
/// Serves a small static table so the demo pipeline and tests run without
/// network access; unknown locations get a fixed fallback forecast.
pub struct WeatherTool;

fn lookup(location: &str) -> Value {
    let key = location.to_lowercase();
    let (temp, unit, condition) = match key.as_str() {
        l if l.contains("boston") => (30, "C", "sunny"),
        l if l.contains("guangzhou") || l.contains("广州") => (28, "C", "humid, light rain"),
        l if l.contains("stockholm") => (4, "C", "overcast"),
        l if l.contains("tokyo") => (18, "C", "clear"),
        _ => (21, "C", "partly cloudy"),
    };
    json!({
        "location": location,
        "temperature": temp,
        "unit": unit,
        "condition": condition,
    })
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_current_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather conditions for a city or location."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "City or location name, e.g. 'Boston' or '广州'"
                }
            },
            "required": ["location"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let location = match call.args.get("location").and_then(|v| v.as_str()) {
            Some(l) if !l.trim().is_empty() => l.to_string(),
            _ => return ToolOutput::err(&call.id, "missing 'location'"),
        };
        debug!(location = %location, "weather tool");
        ToolOutput::json(&call.id, &lookup(&location))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
