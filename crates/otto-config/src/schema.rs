// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default chat model as `"provider/model"`,
    /// e.g. `"anthropic/claude-sonnet-4-5"`.
    pub model: String,

    /// Cheaper model for compaction summaries.  Falls back to a
    /// provider-appropriate default, then to `model`.
    #[serde(default)]
    pub model_compact: Option<String>,
    /// Model for auto-title generation; same fallback chain.
    #[serde(default)]
    pub model_title: Option<String>,
    /// Model for auto-tag generation; same fallback chain.
    #[serde(default)]
    pub model_tags: Option<String>,

    /// API keys by provider id.  Prefer the env-var form in version-controlled
    /// files: a value of `"env:MY_VAR"` reads the key from the environment.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,

    /// Endpoint overrides by provider id, for proxies and self-hosted
    /// gateways.  For the `local` provider this is the NDJSON replay path.
    #[serde(default)]
    pub base_urls: HashMap<String, String>,

    /// Tool names excluded from every session.
    #[serde(default)]
    pub disabled_tools: Vec<String>,

    /// Max output tokens requested per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Custom system prompt override.
    #[serde(default)]
    pub system_prompt: Option<String>,

    // ── Passthrough for tools; not interpreted by the core ───────────────────
    #[serde(default)]
    pub telegram: HashMap<String, String>,
    #[serde(default)]
    pub brave_api_key: Option<String>,
    #[serde(default)]
    pub oauth_tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-5".into(),
            model_compact: None,
            model_title: None,
            model_tags: None,
            api_keys: HashMap::new(),
            base_urls: HashMap::new(),
            disabled_tools: Vec::new(),
            max_tokens: default_max_tokens(),
            system_prompt: None,
            telegram: HashMap::new(),
            brave_api_key: None,
            oauth_tokens: HashMap::new(),
        }
    }
}

impl Config {
    /// Resolve the API key for a provider: explicit config entry first (with
    /// `env:` indirection), then the provider's conventional env var.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        if let Some(raw) = self.api_keys.get(provider) {
            if let Some(var) = raw.strip_prefix("env:") {
                return std::env::var(var).ok();
            }
            return Some(raw.clone());
        }
        let conventional = match provider {
            "anthropic" => "ANTHROPIC_API_KEY",
            "openai" => "OPENAI_API_KEY",
            "zai" => "ZAI_API_KEY",
            "xai" | "grok" => "XAI_API_KEY",
            "mistral" => "MISTRAL_API_KEY",
            "fireworks" => "FIREWORKS_API_KEY",
            _ => return None,
        };
        std::env::var(conventional).ok()
    }

    pub fn base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.get(provider).cloned()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
