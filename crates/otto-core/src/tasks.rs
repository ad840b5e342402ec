// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single-turn background model calls: compaction summaries, auto-titles,
//! auto-tags.  All of them run tool-free on a cheap model and tolerate
//! failure — the turn that triggered them never depends on their success.

use futures::StreamExt;

use otto_model::{
    catalog, Provider, Salvage, StreamAccumulator, StreamRequest, TranscriptMessage,
};

pub(crate) const TITLE_PROMPT: &str = "\
Write a short title (at most eight words) for a coding session that starts \
with the exchange below. Reply with the title only — no quotes, no period.";

pub(crate) const TAGS_PROMPT: &str = "\
Suggest up to five short lowercase tags for the coding session below. \
Reply with the tags only, comma-separated.";

/// Pick the model for a background task: explicit override, then the
/// provider's cheap default, then the session model.
pub(crate) fn task_model(
    override_model: Option<&str>,
    provider_name: &str,
    session_model: &str,
) -> String {
    override_model
        .map(|m| m.to_string())
        .or_else(|| catalog::cheap_model_for(provider_name).map(|m| m.to_string()))
        .unwrap_or_else(|| session_model.to_string())
}

/// One tool-free request; returns the concatenated text of the response.
pub(crate) async fn run_text_task(
    provider: &dyn Provider,
    model: &str,
    system: &str,
    prompt: String,
    max_tokens: u32,
) -> anyhow::Result<String> {
    let req = StreamRequest {
        model: model.to_string(),
        system: system.to_string(),
        messages: vec![TranscriptMessage::user(prompt)],
        tools: vec![],
        max_tokens,
    };
    let mut stream = provider.stream(req).await?;
    let mut acc = StreamAccumulator::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(ev) => {
                if acc.push(ev) {
                    break;
                }
            }
            Err(e) => match acc.salvage(e) {
                Salvage::Complete => break,
                Salvage::Restart(e) => return Err(e.into()),
            },
        }
    }
    let outcome = acc.finish();
    let text: String = outcome
        .blocks
        .iter()
        .filter_map(|b| match b {
            otto_model::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    Ok(text.trim().to_string())
}

/// Normalize a model-produced title: single line, no surrounding quotes,
/// bounded length.
pub(crate) fn clean_title(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or("").trim();
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let mut title = line.trim().to_string();
    if title.len() > 80 {
        let mut end = 80;
        while !title.is_char_boundary(end) {
            end -= 1;
        }
        title.truncate(end);
    }
    title
}

/// Parse a comma-separated tag reply into at most five normalized tags.
pub(crate) fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().trim_matches('#').to_lowercase())
        .filter(|t| !t.is_empty() && t.len() <= 32)
        .take(5)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_model::ScriptedProvider;

    #[test]
    fn task_model_prefers_override() {
        assert_eq!(
            task_model(Some("glm-4-flash"), "anthropic", "claude-sonnet-4-5"),
            "glm-4-flash"
        );
    }

    #[test]
    fn task_model_falls_back_to_provider_cheap_default() {
        assert_eq!(
            task_model(None, "anthropic", "claude-sonnet-4-5"),
            "claude-3-5-haiku-latest"
        );
    }

    #[test]
    fn task_model_falls_back_to_session_model() {
        assert_eq!(task_model(None, "selfhosted", "my-model"), "my-model");
    }

    #[tokio::test]
    async fn run_text_task_returns_trimmed_text() {
        let p = ScriptedProvider::always_text("  Fix login flow  ");
        let out = run_text_task(&p, "m", "", "prompt".into(), 256)
            .await
            .unwrap();
        assert_eq!(out, "Fix login flow");
    }

    #[test]
    fn clean_title_strips_quotes_and_extra_lines() {
        assert_eq!(clean_title("\"Fix the parser\"\nsecond line"), "Fix the parser");
        assert_eq!(clean_title("'Quoted'"), "Quoted");
    }

    #[test]
    fn clean_title_bounds_length() {
        let long = "x".repeat(200);
        assert_eq!(clean_title(&long).len(), 80);
    }

    #[test]
    fn parse_tags_normalizes_and_caps_at_five() {
        let tags = parse_tags("Rust, #Parser , streaming,, a, b, c, d");
        assert_eq!(tags, vec!["rust", "parser", "streaming", "a", "b"]);
    }

    #[test]
    fn parse_tags_empty_reply_yields_nothing() {
        assert!(parse_tags("").is_empty());
        assert!(parse_tags(" , , ").is_empty());
    }
}
