// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Built-in demo tool: paper search with a small static corpus.
pub struct ArxivSearchTool;

const PAPERS: &[(&str, &str, &str)] = &[
    (
        "Scheduling Language-Model Agents as Operating-System Processes",
        "2024",
        "Treats agent turns as preemptible units of work and shows that suspending on tool I/O improves throughput under a fixed concurrency budget.",
    ),
    (
        "Dependency-Aware Decomposition for Tool-Using Agents",
        "2023",
        "Plans are emitted as DAGs of typed subtasks; fan-out with result fan-in outperforms sequential chains on multi-tool benchmarks.",
    ),
    (
        "A Survey of Function Calling Interfaces for Chat Models",
        "2024",
        "Compares JSON-schema tool declaration styles across providers and their failure modes.",
    ),
];

#[async_trait]
impl Tool for ArxivSearchTool {
    fn name(&self) -> &str {
        "arxiv_search"
    }

    fn description(&self) -> &str {
        "Search for academic papers by keyword and return titles with abstracts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search keywords"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => return ToolOutput::err(&call.id, "missing 'query'"),
        };
        debug!(query = %query, "arxiv_search tool");

        let hits: Vec<Value> = PAPERS
            .iter()
            .map(|(title, year, abstract_)| {
                json!({ "title": title, "year": year, "abstract": abstract_ })
            })
            .collect();
        ToolOutput::json(&call.id, &json!({ "query": query, "results": hits }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
