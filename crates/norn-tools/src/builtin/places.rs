// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_LIMIT: u64 = 5;

/// Built-in demo tool: point-of-interest search near a location.
pub struct FindPlacesTool;

fn lookup(keyword: &str, city: &str) -> Vec<Value> {
    let k = keyword.to_lowercase();
    if k.contains("美食") || k.contains("food") || k.contains("restaurant") {
        vec![
            json!({ "name": "Old Town Noodle House", "city": city, "rating": 4.6 }),
            json!({ "name": "Riverside Dim Sum", "city": city, "rating": 4.4 }),
            json!({ "name": "Night Market Stalls", "city": city, "rating": 4.2 }),
        ]
    } else if k.contains("museum") || k.contains("博物馆") {
        vec![
            json!({ "name": "City History Museum", "city": city, "rating": 4.7 }),
            json!({ "name": "Provincial Art Gallery", "city": city, "rating": 4.3 }),
        ]
    } else {
        vec![json!({ "name": format!("{keyword} spot"), "city": city, "rating": 4.0 })]
    }
}

#[async_trait]
impl Tool for FindPlacesTool {
    fn name(&self) -> &str {
        "find_places"
    }

    fn description(&self) -> &str {
        "Search for points of interest (restaurants, museums, sights) in a city."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": {
                    "type": "string",
                    "description": "What to search for, e.g. 'food', '美食', 'museum'"
                },
                "city": {
                    "type": "string",
                    "description": "City to search in"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results (default 5)"
                }
            },
            "required": ["keyword", "city"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let keyword = match call.args.get("keyword").and_then(|v| v.as_str()) {
            Some(k) => k.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'keyword'"),
        };
        let city = match call.args.get("city").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'city'"),
        };
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LIMIT) as usize;

        debug!(keyword = %keyword, city = %city, limit, "find_places tool");

        let mut hits = lookup(&keyword, &city);
        hits.truncate(limit);
        ToolOutput::json(&call.id, &json!({ "keyword": keyword, "results": hits }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "c1".into(), name: "find_places".into(), args }
    }

    #[tokio::test]
    async fn food_search_returns_restaurants() {
        let out = FindPlacesTool
            .execute(&call(json!({ "keyword": "food", "city": "Guangzhou" })))
            .await;
        assert!(!out.is_error);
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert!(parsed["results"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn limit_truncates_results() {
        let out = FindPlacesTool
            .execute(&call(json!({ "keyword": "food", "city": "Guangzhou", "limit": 1 })))
            .await;
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_city_is_error() {
        let out = FindPlacesTool.execute(&call(json!({ "keyword": "food" }))).await;
        assert!(out.is_error);
        assert!(out.content.contains("city"));
    }
}
