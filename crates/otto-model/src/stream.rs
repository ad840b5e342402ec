// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Accumulates a provider event stream into the unified block sequence.
//!
//! The agent loop feeds [`StreamEvent`]s into a [`StreamAccumulator`] as they
//! arrive, forwarding text deltas to its own event sink, and finishes with a
//! [`StreamOutcome`].  Keeping the accumulator synchronous makes the salvage
//! rules unit-testable without a network or a runtime.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::{error::ProviderError, ContentBlock, StopReason, StreamEvent, Usage};

/// The parsed result of one provider call.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// What to do after a mid-stream transport error.
#[derive(Debug)]
pub enum Salvage {
    /// Enough arrived to treat the response as complete; call
    /// [`StreamAccumulator::finish`].
    Complete,
    /// The partial response is unsafe to keep; surface the error so the retry
    /// layer can cleanly restart.
    Restart(ProviderError),
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, fallback_ordinal: usize) -> Option<ContentBlock> {
        // A call with no name cannot be dispatched; storing it would corrupt
        // the history sent back on the next turn.
        if self.name.is_empty() {
            warn!(tool_call_id = %self.id, "dropping tool call with empty name from model");
            return None;
        }
        let id = if self.id.is_empty() {
            warn!(tool_name = %self.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{fallback_ordinal}")
        } else {
            self.id
        };
        let input = parse_arguments(&self.name, &self.args_buf);
        Some(ContentBlock::ToolUse {
            id,
            name: self.name,
            input,
        })
    }
}

/// Resolve the accumulated argument text to a JSON object.  Providers must
/// receive an object on the next turn; `null` or scalars yield a 400.
fn parse_arguments(name: &str, buf: &str) -> Map<String, Value> {
    if buf.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(buf) {
        Ok(Value::Object(m)) => m,
        // Models occasionally emit invalid escapes (`\c`, `\(`); escaping the
        // stray backslash usually recovers the object.
        _ => match serde_json::from_str::<Value>(&fix_invalid_json_escapes(buf)) {
            Ok(Value::Object(m)) => {
                warn!(tool_name = %name, "repaired invalid JSON arguments from model");
                m
            }
            _ => {
                warn!(
                    tool_name = %name,
                    args = %buf,
                    "model sent unparseable tool arguments; substituting empty object"
                );
                Map::new()
            }
        },
    }
}

/// Replace invalid escape sequences inside JSON string values with `\\X`.
/// Valid JSON escapes are `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`, `u`.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

/// Reassembles streamed fragments into content blocks.
#[derive(Default)]
pub struct StreamAccumulator {
    text: String,
    compaction: String,
    // Keyed by the provider's block/tool-call index.  Delta-SSE interleaves
    // fragments for parallel calls; block-SSE opens blocks by position.
    pending: HashMap<u32, PendingToolCall>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event.  Returns `true` when the stream signalled completion.
    pub fn push(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::TextDelta(t) => self.text.push_str(&t),
            StreamEvent::CompactionDelta(s) => self.compaction.push_str(&s),
            StreamEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let p = self.pending.entry(index).or_default();
                if !id.is_empty() {
                    p.id = id;
                }
                if !name.is_empty() {
                    p.name = name;
                }
                p.args_buf.push_str(&arguments);
            }
            StreamEvent::Usage(u) => self.usage.merge(&u),
            StreamEvent::Stop(reason) => self.stop_reason = Some(reason),
            StreamEvent::Done => self.done = true,
        }
        self.done
    }

    /// Decide how to handle a transport error observed mid-stream.
    ///
    /// Intermediaries (chunked-transfer proxies, TLS interceptors) may
    /// truncate a stream that the provider completed.  Everything buffered so
    /// far survives; the rules are:
    ///
    /// - a stop reason was observed → the response is complete;
    /// - only text arrived → keep it as `end_turn` (partial text is always
    ///   safer to keep than to lose);
    /// - a tool call arrived → restart, because partial tool arguments are
    ///   unsafe to execute.
    pub fn salvage(&self, err: ProviderError) -> Salvage {
        if self.stop_reason.is_some() {
            return Salvage::Complete;
        }
        if self.pending.is_empty() && !self.text.is_empty() {
            warn!(error = %err, "stream dropped mid-response; salvaging partial text");
            return Salvage::Complete;
        }
        Salvage::Restart(err)
    }

    /// Whether a stop reason has been observed yet.
    pub fn saw_stop_reason(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Finalize into blocks + stop reason + usage.
    pub fn finish(self) -> StreamOutcome {
        let mut blocks = Vec::new();
        if !self.compaction.is_empty() {
            blocks.push(ContentBlock::Compaction {
                summary_text: self.compaction,
            });
        }
        if !self.text.is_empty() {
            blocks.push(ContentBlock::Text { text: self.text });
        }
        let mut pending: Vec<(u32, PendingToolCall)> = self.pending.into_iter().collect();
        pending.sort_by_key(|(idx, _)| *idx);
        let mut had_tool_use = false;
        for (i, (_, p)) in pending.into_iter().enumerate() {
            if let Some(block) = p.finish(i) {
                had_tool_use = true;
                blocks.push(block);
            }
        }
        let stop_reason = self.stop_reason.unwrap_or(if had_tool_use {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        StreamOutcome {
            blocks,
            stop_reason,
            usage: self.usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
