// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;
pub(crate) mod openai_compat;
mod mock;
mod provider;
mod routed_mock;
mod types;

pub use mock::{MockProvider, ScriptedMockProvider, ScriptedReply};
pub use provider::ModelProvider;
pub use registry::{get_driver, list_drivers, DriverMeta};
pub use routed_mock::{MatchType, MockRules, ResponseRule, RoutedMockProvider, ToolCallDef};
pub use types::*;

use std::time::Duration;

use anyhow::bail;
use norn_config::ModelConfig;
use openai_compat::{AuthStyle, OpenAICompatProvider};

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`.  Run
/// `norn list-providers` to see all recognised provider ids.  Every
/// HTTP-backed driver shares the OpenAI-compatible implementation and is
/// configured here with its registry defaults.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    if cfg.provider == "mock" {
        let rules_path = std::env::var("NORN_MOCK_RESPONSES")
            .ok()
            .or_else(|| cfg.mock_responses_file.clone());
        return if let Some(path) = rules_path {
            Ok(Box::new(RoutedMockProvider::from_file(&path)?))
        } else {
            Ok(Box::new(MockProvider))
        };
    }

    let Some(meta) = registry::get_driver(&cfg.provider) else {
        let known: Vec<&str> = registry::known_driver_ids().collect();
        bail!(
            "unknown model provider: {provider:?}\n\
             Run `norn list-providers` for a full list, or check your config.\n\
             Known providers: {known}",
            provider = cfg.provider,
            known = known.join(", ")
        )
    };

    let base_url = match (&cfg.base_url, meta.default_base_url) {
        (Some(b), _) => b.clone(),
        (None, Some(d)) => d.to_string(),
        (None, None) => bail!("provider {:?} requires base_url in config", cfg.provider),
    };

    let key = resolve_api_key(cfg);
    // Local servers accept an optional bearer token; hosted providers
    // always authenticate.
    let auth_style = if meta.default_api_key_env.is_some() || key.is_some() {
        AuthStyle::Bearer
    } else {
        AuthStyle::None
    };

    Ok(Box::new(OpenAICompatProvider::new(
        meta.id,
        cfg.name.clone(),
        key,
        &base_url,
        cfg.max_tokens,
        cfg.temperature,
        Duration::from_secs(cfg.timeout_secs),
        auth_style,
    )))
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    // Auto-resolve from registry default env var if neither is set.
    if let Some(meta) = registry::get_driver(&cfg.provider) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}

// ── Model-config resolution ───────────────────────────────────────────────────

/// Build a [`ModelConfig`] by applying `override_str` on top of `base`.
///
/// The override string may be:
/// - `"provider/model"` → sets both provider and name (e.g. `"groq/llama-3.3-70b"`)
/// - bare registered provider id (e.g. `"groq"`, `"ollama"`) → changes provider, keeps model name
/// - bare model name (no `/`, not a known provider id) → changes model name, keeps provider
///
/// When the provider changes, inherited `api_key` / `api_key_env` fields are
/// cleared so the correct credential env-var for the new provider is looked up.
pub fn resolve_model_cfg(base: &ModelConfig, override_str: &str) -> ModelConfig {
    let mut cfg = base.clone();
    let provider_changed;
    if let Some((provider, model)) = override_str.split_once('/') {
        provider_changed = provider != base.provider;
        cfg.provider = provider.to_string();
        cfg.name = model.to_string();
    } else if get_driver(override_str).is_some() {
        // Bare provider id — change provider, keep the current model name.
        provider_changed = override_str != base.provider;
        cfg.provider = override_str.to_string();
    } else {
        cfg.name = override_str.to_string();
        provider_changed = false;
    }
    // When the provider changes the inherited api_key / api_key_env belong to
    // the original provider.  Clear them so resolve_api_key() falls through to
    // the new provider's registry default env var.
    if provider_changed {
        cfg.api_key = None;
        cfg.api_key_env = None;
        cfg.base_url = None;
    }
    cfg
}

/// Resolve a [`ModelConfig`] using `override_str`, checking
/// `config.providers` for named custom providers first.
///
/// If the prefix of `override_str` (the part before an optional `/`) matches
/// a key in `config.providers`, that named config is used as the base and
/// only the model name portion is optionally overridden.  Otherwise the call
/// falls back to [`resolve_model_cfg`] with `config.model` as the base.
pub fn resolve_model_from_config(
    config: &norn_config::Config,
    override_str: &str,
) -> ModelConfig {
    let (provider_key, model_suffix) = if let Some((p, m)) = override_str.split_once('/') {
        (p, Some(m))
    } else {
        (override_str, None)
    };

    // Named custom provider in config.providers takes precedence.
    if let Some(named) = config.providers.get(provider_key) {
        let mut cfg = named.clone();
        if let Some(model) = model_suffix {
            cfg.name = model.to_string();
        }
        return cfg;
    }

    resolve_model_cfg(&config.model, override_str)
}
