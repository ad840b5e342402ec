// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use serde_json::{json, Value};

use async_trait::async_trait;

use crate::{
    error::ProviderError,
    http,
    provider::{EventStream, Provider},
    ContentBlock, Role, StopReason, StreamEvent, StreamRequest, TranscriptMessage, Usage,
};

/// Block-SSE driver: Anthropic's `/v1/messages` wire format and compatible
/// wrappers.  Events are typed (`message_start`, `content_block_start`,
/// `content_block_delta`, `message_delta`, `message_stop`); multiple content
/// blocks may be open concurrently, indexed by integer position.
pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, req: StreamRequest) -> Result<EventStream, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Config("ANTHROPIC_API_KEY not set".into()))?;

        let messages = build_anthropic_messages(&req.messages);

        // System prompt and tool list each carry an ephemeral cache marker so
        // repeated turns within a short window charge a fraction of full
        // input cost.
        let tools: Vec<Value> = {
            let last = req.tools.len().wrapping_sub(1);
            req.tools
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let mut v = json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    });
                    if i == last {
                        v["cache_control"] = json!({ "type": "ephemeral" });
                    }
                    v
                })
                .collect()
        };

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": true,
        });
        if !req.system.is_empty() {
            body["system"] = json!([{
                "type": "text",
                "text": req.system,
                "cache_control": { "type": "ephemeral" },
            }]);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        tracing::debug!(
            model = %req.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending anthropic request"
        );

        let resp = http::client()
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_response(status, &headers, &text));
        }

        // SSE lines can be split across TCP chunks; carry a remainder buffer
        // forward and parse only complete lines.
        let event_stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, ProviderError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_block_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ProviderError::Stream(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Config("ANTHROPIC_API_KEY not set".into()))?;
        let resp = http::client()
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_response(status, &headers, &text));
        }
        let body: Value = resp.json().await?;
        let mut ids: Vec<String> = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}

fn drain_block_sse_lines(buf: &mut String) -> Vec<Result<StreamEvent, ProviderError>> {
    let mut events = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        buf.drain(..=pos);
        if let Some(data) = line.strip_prefix("data: ") {
            if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                events.extend(parse_block_sse_event(&v));
            }
        }
    }
    events
}

/// Parse one block-SSE JSON event into zero or more [`StreamEvent`]s.
pub(crate) fn parse_block_sse_event(v: &Value) -> Vec<Result<StreamEvent, ProviderError>> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let usage = &v["message"]["usage"];
            if usage.is_object() {
                vec![Ok(StreamEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: 0,
                    cache_creation_input_tokens: usage["cache_creation_input_tokens"]
                        .as_u64()
                        .unwrap_or(0),
                    cache_read_input_tokens: usage["cache_read_input_tokens"]
                        .as_u64()
                        .unwrap_or(0),
                }))]
            } else {
                vec![]
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "tool_use" => vec![Ok(StreamEvent::ToolCall {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                })],
                _ => vec![],
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![Ok(StreamEvent::TextDelta(text.to_string()))]
                    }
                }
                "input_json_delta" => vec![Ok(StreamEvent::ToolCall {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                })],
                "compaction_delta" => {
                    let summary = delta["summary"].as_str().unwrap_or("");
                    if summary.is_empty() {
                        vec![]
                    } else {
                        vec![Ok(StreamEvent::CompactionDelta(summary.to_string()))]
                    }
                }
                _ => vec![],
            }
        }
        "message_delta" => {
            let mut out = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                out.push(Ok(StreamEvent::Stop(StopReason::from_block_sse(reason))));
            }
            if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
                out.push(Ok(StreamEvent::Usage(Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                    cache_creation_input_tokens: 0,
                    cache_read_input_tokens: 0,
                })));
            }
            out
        }
        "message_stop" => vec![Ok(StreamEvent::Done)],
        // An in-stream error event, e.g. overload reported after the stream
        // opened.  Kind-based classification still applies in the retry layer.
        "error" => {
            let err = &v["error"];
            vec![Err(ProviderError::Api {
                status: 0,
                kind: err["type"].as_str().unwrap_or("").to_string(),
                message: err["message"].as_str().unwrap_or("").to_string(),
                retry_after: None,
            })]
        }
        // ping and future event types
        _ => vec![],
    }
}

/// Convert transcript messages into the Anthropic wire format.
///
/// The spec-level invariant that `tool_result` blocks live in user messages
/// directly after the assistant's `tool_use` message matches this wire format
/// exactly, so the translation is block-by-block.
pub(crate) fn build_anthropic_messages(messages: &[TranscriptMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            if m.blocks.is_empty() {
                return json!({ "role": role, "content": m.content });
            }
            let content: Vec<Value> = m
                .blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                    ContentBlock::ToolUse { id, name, input } => json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    }),
                    ContentBlock::ToolResult {
                        id,
                        result,
                        is_error,
                        ..
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": id,
                        "content": result,
                        "is_error": is_error,
                    }),
                    // A summary produced by an earlier compaction is replayed
                    // as plain text; the wire has no first-class slot for it.
                    ContentBlock::Compaction { summary_text } => {
                        json!({ "type": "text", "text": summary_text })
                    }
                })
                .collect();
            json!({ "role": role, "content": content })
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
