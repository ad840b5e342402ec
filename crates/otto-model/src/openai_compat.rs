// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Delta-SSE driver: the OpenAI `/chat/completions` streaming wire format.
//!
//! Several hosted providers speak this format verbatim (Z.AI, Grok, Mistral,
//! Fireworks, OpenAI itself); each configures this one driver with its own
//! endpoint and auth.  Chunks arrive as `choices[].delta` objects carrying
//! interleaved content fragments and sparse `tool_calls` keyed by index,
//! terminated by a `[DONE]` sentinel and a `finish_reason`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::{
    error::ProviderError,
    http,
    provider::{EventStream, Provider},
    ContentBlock, Role, StopReason, StreamEvent, StreamRequest, TranscriptMessage, Usage,
};

/// How the API key travels in requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — every hosted provider.
    Bearer,
    /// No auth header — local servers.
    None,
}

pub struct OpenAiCompatProvider {
    driver_name: String,
    api_key: Option<String>,
    chat_url: String,
    models_url: String,
    auth_style: AuthStyle,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiCompatProvider {
    pub fn new(
        driver_name: impl Into<String>,
        api_key: Option<String>,
        base_url: &str,
        auth_style: AuthStyle,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name: driver_name.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            auth_style,
            extra_headers,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ProviderError> {
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref().ok_or_else(|| {
                    ProviderError::Config(format!(
                        "API key for provider {:?} not set",
                        self.driver_name
                    ))
                })?;
                Ok(req.bearer_auth(key))
            }
            AuthStyle::None => Ok(req),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.driver_name
    }

    async fn stream(&self, req: StreamRequest) -> Result<EventStream, ProviderError> {
        let messages = build_openai_messages(&req.system, &req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "stream": true,
            "max_tokens": req.max_tokens,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        tracing::debug!(
            driver = %self.driver_name,
            model = %req.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = http::client().post(&self.chat_url).json(&body);
        http_req = self.authorize(http_req)?;
        for (name, val) in &self.extra_headers {
            http_req = http_req.header(name.as_str(), val.as_str());
        }

        let resp = http_req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_response(status, &headers, &text));
        }

        // SSE events can be split across TCP packets; keep a line buffer
        // across chunks and parse only complete lines.
        let event_stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, ProviderError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_delta_sse_lines(buf)
                    }
                    Err(e) => vec![Err(ProviderError::Stream(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        let mut http_req = http::client().get(&self.models_url);
        http_req = self.authorize(http_req)?;
        let resp = http_req.send().await?;
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

fn drain_delta_sse_lines(buf: &mut String) -> Vec<Result<StreamEvent, ProviderError>> {
    let mut events = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        buf.drain(..=pos);
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            events.push(Ok(StreamEvent::Done));
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(data) {
            events.extend(parse_delta_sse_chunk(&v).into_iter().map(Ok));
        }
    }
    events
}

/// Parse one `choices[].delta` chunk into zero or more [`StreamEvent`]s.
pub(crate) fn parse_delta_sse_chunk(v: &Value) -> Vec<StreamEvent> {
    // Usage-only chunk, emitted last when stream_options.include_usage is on.
    if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
        let cache_read = usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        return vec![StreamEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: cache_read,
        })];
    }

    let choice = &v["choices"][0];
    let mut out = Vec::new();

    if let Some(reason) = choice["finish_reason"].as_str() {
        out.push(StreamEvent::Stop(StopReason::from_finish_reason(reason)));
    }

    let delta = &choice["delta"];
    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            out.push(StreamEvent::ToolCall {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
            });
        }
        return out;
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            out.push(StreamEvent::TextDelta(text.to_string()));
        }
    }
    out
}

/// Convert the system prompt plus transcript into the OpenAI wire format.
///
/// The transcript keeps all of one turn's `tool_use` blocks in a single
/// assistant message; this format wants them as one `tool_calls` array, and
/// wants each `tool_result` as its own `role:"tool"` message, so the
/// translation regroups blocks rather than mapping messages one-to-one.
pub(crate) fn build_openai_messages(
    system: &str,
    messages: &[TranscriptMessage],
) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        out.push(json!({ "role": "system", "content": system }));
    }

    for m in messages {
        if m.blocks.is_empty() {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            out.push(json!({ "role": role, "content": m.content }));
            continue;
        }
        match m.role {
            Role::Assistant => {
                let mut text = String::new();
                let mut calls: Vec<Value> = Vec::new();
                for b in &m.blocks {
                    match b {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::Compaction { summary_text } => text.push_str(summary_text),
                        ContentBlock::ToolUse { id, name, input } => calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": Value::Object(input.clone()).to_string(),
                            }
                        })),
                        // tool_result never appears in assistant messages
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };
                if !calls.is_empty() {
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
            Role::User => {
                let mut text = String::new();
                for b in &m.blocks {
                    match b {
                        ContentBlock::ToolResult { id, result, .. } => out.push(json!({
                            "role": "tool",
                            "tool_call_id": id,
                            "content": result,
                        })),
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::Compaction { summary_text } => text.push_str(summary_text),
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                if !text.is_empty() {
                    out.push(json!({ "role": "user", "content": text }));
                }
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
