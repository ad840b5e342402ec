// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod http;
mod anthropic;
mod error;
mod mock;
mod ndjson;
mod openai_compat;
mod provider;
mod stream;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::{parse_retry_after, ProviderError};
pub use mock::{MockEvent, ScriptedCall, ScriptedProvider};
pub use ndjson::NdjsonProvider;
pub use openai_compat::{AuthStyle, OpenAiCompatProvider};
pub use provider::{EventStream, Provider};
pub use stream::{Salvage, StreamAccumulator, StreamOutcome};
pub use types::*;

use std::sync::Arc;

/// Construct a [`Provider`] from a provider id, key, and optional endpoint
/// override.
///
/// The delta-SSE gateways all share one driver configured with their
/// endpoint; `anthropic` uses the block-SSE driver; `local` replays an NDJSON
/// file (`base_url` is the file path); `mock` is for tests and dry runs.
pub fn from_config(
    provider: &str,
    api_key: Option<String>,
    base_url: Option<String>,
) -> anyhow::Result<Arc<dyn Provider>> {
    let url = |default: &str| base_url.clone().unwrap_or_else(|| default.into());
    let p: Arc<dyn Provider> = match provider {
        "anthropic" => Arc::new(AnthropicProvider::new(api_key, base_url)),
        "openai" => Arc::new(OpenAiCompatProvider::new(
            "openai",
            api_key,
            &url("https://api.openai.com/v1"),
            AuthStyle::Bearer,
            vec![],
        )),
        "zai" => Arc::new(OpenAiCompatProvider::new(
            "zai",
            api_key,
            &url("https://api.z.ai/api/paas/v4"),
            AuthStyle::Bearer,
            vec![],
        )),
        "xai" | "grok" => Arc::new(OpenAiCompatProvider::new(
            "xai",
            api_key,
            &url("https://api.x.ai/v1"),
            AuthStyle::Bearer,
            vec![],
        )),
        "mistral" => Arc::new(OpenAiCompatProvider::new(
            "mistral",
            api_key,
            &url("https://api.mistral.ai/v1"),
            AuthStyle::Bearer,
            vec![],
        )),
        "fireworks" => Arc::new(OpenAiCompatProvider::new(
            "fireworks",
            api_key,
            &url("https://api.fireworks.ai/inference/v1"),
            AuthStyle::Bearer,
            vec![],
        )),
        "local" => {
            let path = base_url
                .ok_or_else(|| anyhow::anyhow!("local provider requires a replay file path"))?;
            Arc::new(NdjsonProvider::new(path))
        }
        "mock" => Arc::new(ScriptedProvider::always_text("mock reply")),
        other => anyhow::bail!(
            "unknown model provider: {other:?}\n\
             Known providers: anthropic, openai, zai, xai, mistral, fireworks, local, mock"
        ),
    };
    Ok(p)
}

/// Split a `"provider/model"` string into its parts.
pub fn split_model_ref(model_ref: &str) -> anyhow::Result<(&str, &str)> {
    model_ref
        .split_once('/')
        .filter(|(p, m)| !p.is_empty() && !m.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("model must be \"provider/model\", got {model_ref:?}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_known_providers() {
        for p in ["anthropic", "openai", "zai", "xai", "mistral", "fireworks", "mock"] {
            assert!(from_config(p, Some("k".into()), None).is_ok(), "{p} failed");
        }
    }

    #[test]
    fn from_config_unknown_provider_errors() {
        let err = from_config("bogus", None, None).err().unwrap().to_string();
        assert!(err.contains("unknown model provider"));
    }

    #[test]
    fn from_config_local_requires_path() {
        assert!(from_config("local", None, None).is_err());
        assert!(from_config("local", None, Some("/tmp/replay.ndjson".into())).is_ok());
    }

    #[test]
    fn split_model_ref_parses_provider_and_model() {
        let (p, m) = split_model_ref("anthropic/claude-sonnet-4-5").unwrap();
        assert_eq!(p, "anthropic");
        assert_eq!(m, "claude-sonnet-4-5");
    }

    #[test]
    fn split_model_ref_rejects_bare_names() {
        assert!(split_model_ref("gpt-4o").is_err());
        assert!(split_model_ref("/x").is_err());
        assert!(split_model_ref("x/").is_err());
    }
}
