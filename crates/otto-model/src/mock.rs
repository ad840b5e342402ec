// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use crate::{
    error::ProviderError,
    provider::{EventStream, Provider},
    StopReason, StreamEvent, StreamRequest, Usage,
};

/// One scripted provider call.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// The request itself fails before any streaming starts.
    Fail {
        status: u16,
        kind: String,
        message: String,
        retry_after: Option<Duration>,
    },
    /// The request streams these items; `StreamError` entries surface as
    /// mid-stream transport errors.
    Events(Vec<MockEvent>),
}

#[derive(Debug, Clone)]
pub enum MockEvent {
    Event(StreamEvent),
    StreamError(String),
}

/// A pre-scripted provider.  Each `stream` call pops the next script from the
/// front of the queue, so tests can specify exact event sequences — including
/// tool calls, rate limits, and truncated streams — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<ScriptedCall>>>,
    /// Number of `stream` calls observed so far.
    pub calls: Arc<Mutex<u32>>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<StreamRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<ScriptedCall>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            calls: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    fn text_script(reply: &str) -> ScriptedCall {
        ScriptedCall::Events(vec![
            MockEvent::Event(StreamEvent::TextDelta(reply.to_string())),
            MockEvent::Event(StreamEvent::Usage(Usage {
                input_tokens: 100,
                output_tokens: 50,
                ..Usage::default()
            })),
            MockEvent::Event(StreamEvent::Stop(StopReason::EndTurn)),
            MockEvent::Event(StreamEvent::Done),
        ])
    }

    /// Provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![Self::text_script(&r)])
    }

    /// Provider that emits one tool call, then a text reply on the next call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedCall::Events(vec![
                MockEvent::Event(StreamEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                }),
                MockEvent::Event(StreamEvent::Usage(Usage {
                    input_tokens: 100,
                    output_tokens: 20,
                    ..Usage::default()
                })),
                MockEvent::Event(StreamEvent::Stop(StopReason::ToolUse)),
                MockEvent::Event(StreamEvent::Done),
            ]),
            Self::text_script(&final_text.into()),
        ])
    }

    /// Provider that fails `failures` times with a 429, then succeeds.
    pub fn rate_limited_then_text(
        failures: usize,
        retry_after: Option<Duration>,
        reply: impl Into<String>,
    ) -> Self {
        let mut scripts: Vec<ScriptedCall> = (0..failures)
            .map(|_| ScriptedCall::Fail {
                status: 429,
                kind: "rate_limit_error".into(),
                message: "rate limited".into(),
                retry_after,
            })
            .collect();
        scripts.push(Self::text_script(&reply.into()));
        Self::new(scripts)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream(&self, req: StreamRequest) -> Result<EventStream, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        *self.last_request.lock().unwrap() = Some(req);
        let call = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback once all scripts are consumed.
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        match call {
            ScriptedCall::Fail {
                status,
                kind,
                message,
                retry_after,
            } => Err(ProviderError::Api {
                status,
                kind,
                message,
                retry_after,
            }),
            ScriptedCall::Events(events) => {
                let items: Vec<Result<StreamEvent, ProviderError>> = events
                    .into_iter()
                    .map(|e| match e {
                        MockEvent::Event(ev) => Ok(ev),
                        MockEvent::StreamError(msg) => Err(ProviderError::Stream(msg)),
                    })
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["scripted-mock-model".into()])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn req() -> StreamRequest {
        StreamRequest {
            model: "m".into(),
            ..StreamRequest::default()
        }
    }

    #[tokio::test]
    async fn always_text_streams_reply_then_done() {
        let p = ScriptedProvider::always_text("hello");
        let mut s = p.stream(req()).await.unwrap();
        let first = s.next().await.unwrap().unwrap();
        assert!(matches!(&first, StreamEvent::TextDelta(t) if t == "hello"));
        let mut last = first;
        while let Some(ev) = s.next().await {
            last = ev.unwrap();
        }
        assert!(matches!(last, StreamEvent::Done));
    }

    #[tokio::test]
    async fn rate_limited_then_text_fails_then_succeeds() {
        let p = ScriptedProvider::rate_limited_then_text(1, Some(Duration::from_millis(100)), "ok");
        let err = p.stream(req()).await.err().unwrap();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(100)));
        assert!(p.stream(req()).await.is_ok());
        assert_eq!(*p.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn last_request_records_what_was_sent() {
        let p = ScriptedProvider::always_text("x");
        let mut r = req();
        r.system = "be brief".into();
        let _ = p.stream(r).await.unwrap();
        let seen = p.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.system, "be brief");
    }
}
