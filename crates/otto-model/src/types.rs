// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// The unified unit of model output.
///
/// Every provider driver, whatever its wire format, parses its stream into a
/// sequence of these blocks.  The same shape is stored in the transcript, so a
/// persisted message round-trips through the store without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Parsed JSON argument object.  Tool handlers extract fields by name.
        input: Map<String, Value>,
    },
    ToolResult {
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    /// Server-generated context compaction (emitted by providers that compact
    /// the conversation on their side).
    Compaction {
        summary_text: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Map<String, Value>,
    ) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            id: id.into(),
            name: name.into(),
            result: result.into(),
            is_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in a session transcript.
///
/// When `blocks` is empty, `content` carries the plain text.  Otherwise
/// `content` is the concatenation of the text blocks — derived, kept only for
/// display and search.  The system prompt is not a transcript message; it
/// travels separately in [`StreamRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
    pub content: String,
}

impl TranscriptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: Vec::new(),
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            blocks: Vec::new(),
            content: text.into(),
        }
    }

    /// Build a structured message; `content` is derived from the text blocks.
    pub fn with_blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        let content = concat_text(&blocks);
        Self {
            role,
            blocks,
            content,
        }
    }

    /// All `tool_use` blocks, in block order.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Map<String, Value>)> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    /// Ids of all `tool_result` blocks, in block order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn has_tool_result(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }

    /// Approximate token count for context accounting (4 chars per token).
    pub fn approx_tokens(&self) -> u64 {
        let chars: usize = if self.blocks.is_empty() {
            self.content.len()
        } else {
            self.blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + Value::Object(input.clone()).to_string().len()
                    }
                    ContentBlock::ToolResult { result, .. } => result.len(),
                    ContentBlock::Compaction { summary_text } => summary_text.len(),
                })
                .sum()
        };
        ((chars / 4).max(1)) as u64
    }
}

fn concat_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
}

/// One completion request handed to a [`crate::Provider`].
///
/// A single call performs one request/response; multi-turn is the agent
/// loop's responsibility.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<TranscriptMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

// ─── Streaming events ─────────────────────────────────────────────────────────

/// Normalized terminal signal from a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// Provider-specific value passed through untransformed.
    Other(String),
}

impl StopReason {
    /// Block-SSE values pass through; the three known ones map to variants.
    pub fn from_block_sse(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }

    /// Delta-SSE `finish_reason` normalization.
    pub fn from_finish_reason(raw: &str) -> Self {
        match raw {
            "stop" => Self::EndTurn,
            "tool_calls" => Self::ToolUse,
            "length" => Self::MaxTokens,
            // A filtered response still ended; the partial text is kept.
            "content_filter" => Self::EndTurn,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndTurn => write!(f, "end_turn"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::MaxTokens => write!(f, "max_tokens"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Token usage from one provider call.  Cache fields inform cost computation
/// but never retry decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Fold a later usage report into this one.  Counters are monotonic per
    /// turn; a later non-zero value replaces an earlier zero.
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
    }
}

/// A single streamed event from a provider driver.
///
/// Both wire families (and the NDJSON driver) parse into this shape.  Tool
/// call arguments arrive as sparse deltas keyed by the provider's block
/// index; the accumulator reassembles them.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text fragment.
    TextDelta(String),
    /// A tool-call fragment.  The first event for an index carries `id` and
    /// `name`; subsequent events append to `arguments`.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// A server-side compaction summary fragment.
    CompactionDelta(String),
    /// Usage statistics (may arrive more than once; later reports win).
    Usage(Usage),
    /// The provider reported a stop reason.
    Stop(StopReason),
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
