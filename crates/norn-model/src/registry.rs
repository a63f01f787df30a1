// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static driver registry.
//!
//! Maps provider ids to their default endpoint and credential env var so
//! that a bare `provider: groq` in the config is enough to construct a
//! working driver.  `norn list-providers` prints this table.

/// Metadata for one registered driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverMeta {
    /// Stable id used in config files and `--model provider/name` overrides.
    pub id: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Default chat-completions base URL (ends before `/chat/completions`).
    /// `None` for drivers that are not HTTP-backed (mock).
    pub default_base_url: Option<&'static str>,
    /// Environment variable consulted for the API key when the config does
    /// not set `api_key` / `api_key_env`.
    pub default_api_key_env: Option<&'static str>,
}

const DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "openai",
        label: "OpenAI",
        default_base_url: Some("https://api.openai.com/v1"),
        default_api_key_env: Some("OPENAI_API_KEY"),
    },
    DriverMeta {
        id: "openrouter",
        label: "OpenRouter",
        default_base_url: Some("https://openrouter.ai/api/v1"),
        default_api_key_env: Some("OPENROUTER_API_KEY"),
    },
    DriverMeta {
        id: "groq",
        label: "Groq",
        default_base_url: Some("https://api.groq.com/openai/v1"),
        default_api_key_env: Some("GROQ_API_KEY"),
    },
    DriverMeta {
        id: "deepseek",
        label: "DeepSeek",
        default_base_url: Some("https://api.deepseek.com/v1"),
        default_api_key_env: Some("DEEPSEEK_API_KEY"),
    },
    DriverMeta {
        id: "moonshot",
        label: "Moonshot",
        default_base_url: Some("https://api.moonshot.cn/v1"),
        default_api_key_env: Some("MOONSHOT_API_KEY"),
    },
    DriverMeta {
        id: "ollama",
        label: "Ollama (local)",
        default_base_url: Some("http://localhost:11434/v1"),
        default_api_key_env: None,
    },
    DriverMeta {
        id: "vllm",
        label: "vLLM (local)",
        default_base_url: Some("http://localhost:8000/v1"),
        default_api_key_env: None,
    },
    DriverMeta {
        id: "lmstudio",
        label: "LM Studio (local)",
        default_base_url: Some("http://localhost:1234/v1"),
        default_api_key_env: None,
    },
    DriverMeta {
        id: "mock",
        label: "Mock (testing)",
        default_base_url: None,
        default_api_key_env: None,
    },
];

/// Look up a driver by id.
pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// All registered drivers, in display order.
pub fn list_drivers() -> &'static [DriverMeta] {
    DRIVERS
}

/// Iterator over all known driver ids.
pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
