// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local NDJSON provider.
//!
//! Streams newline-delimited JSON events from a file, one event per line:
//!
//! ```text
//! {"event":"text","text":"Hello"}
//! {"event":"tool_call","index":0,"id":"u1","name":"list_files","arguments":"{}"}
//! {"event":"usage","input_tokens":10,"output_tokens":5}
//! {"event":"stop","stop_reason":"end_turn"}
//! ```
//!
//! The output contract is identical to the network drivers, which makes this
//! the cheapest way to replay a recorded stream in demos and fixtures.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::{
    error::ProviderError,
    provider::{EventStream, Provider},
    StopReason, StreamEvent, StreamRequest, Usage,
};

pub struct NdjsonProvider {
    path: PathBuf,
}

impl NdjsonProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Provider for NdjsonProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn stream(&self, _req: StreamRequest) -> Result<EventStream, ProviderError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProviderError::Config(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let mut events: Vec<Result<StreamEvent, ProviderError>> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_ndjson_line)
            .collect();
        events.push(Ok(StreamEvent::Done));
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["local".into()])
    }
}

fn parse_ndjson_line(line: &str) -> Result<StreamEvent, ProviderError> {
    let v: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ProviderError::Stream(format!("malformed NDJSON line: {e}")))?;
    let ev = match v["event"].as_str().unwrap_or("") {
        "text" => StreamEvent::TextDelta(v["text"].as_str().unwrap_or("").to_string()),
        "tool_call" => StreamEvent::ToolCall {
            index: v["index"].as_u64().unwrap_or(0) as u32,
            id: v["id"].as_str().unwrap_or("").to_string(),
            name: v["name"].as_str().unwrap_or("").to_string(),
            arguments: v["arguments"].as_str().unwrap_or("").to_string(),
        },
        "usage" => StreamEvent::Usage(Usage {
            input_tokens: v["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: v["output_tokens"].as_u64().unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        }),
        "stop" => StreamEvent::Stop(StopReason::from_block_sse(
            v["stop_reason"].as_str().unwrap_or("end_turn"),
        )),
        other => {
            return Err(ProviderError::Stream(format!(
                "unknown NDJSON event type: {other:?}"
            )))
        }
    };
    Ok(ev)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
