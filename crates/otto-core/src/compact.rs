// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Middle-window context compaction.
//!
//! When the input-token watermark passes the threshold, the middle of the
//! transcript is replaced by a synthetic user/assistant pair and summarized
//! by a cheap model.  The first user+assistant exchange and the recent tail
//! survive verbatim; the synthetic pair keeps role alternation intact.

use otto_model::{ContentBlock, Role, TranscriptMessage};
use serde_json::Value;

/// Input-token watermark above which compaction runs.
pub const COMPACTION_TOKEN_THRESHOLD: u64 = 100_000;
/// Number of trailing messages preserved verbatim.
pub const COMPACTION_KEEP_TAIL: usize = 20;
/// Transcripts at or below this length are never compacted.
const MIN_COMPACTABLE: usize = 22;

/// Assistant half of the synthetic pair.
pub const COMPACTION_ACK: &str = "Understood. I'll continue with the context available.";

/// The five-section structure keeps summaries predictable enough for the
/// model to rely on after resume.
pub const SUMMARY_PROMPT: &str = "\
Summarize the following conversation between a user and an AI coding agent. \
Structure the summary in exactly five sections: \
(1) topics discussed, (2) files modified, (3) tools used, (4) key decisions, \
(5) current task state. \
Be information-dense; keep file paths, commands, and error messages verbatim.";

const TOOL_INPUT_CLIP: usize = 300;
const TOOL_RESULT_CLIP: usize = 200;
const SERIALIZED_CLIP: usize = 30_000;

/// A planned compaction: the half-open range `[head_end, tail_start)` is
/// dropped and replaced by the synthetic pair.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub head_end: usize,
    pub tail_start: usize,
    pub dropped: Vec<TranscriptMessage>,
}

impl CompactionPlan {
    /// Index of the synthetic user placeholder after [`apply_compaction`].
    pub fn placeholder_index(&self) -> usize {
        self.head_end
    }
}

/// Decide what to drop, or `None` when the transcript is too small or the
/// split cannot land on a user message without consuming the whole tail.
pub fn plan_compaction(messages: &[TranscriptMessage]) -> Option<CompactionPlan> {
    if messages.len() <= MIN_COMPACTABLE {
        return None;
    }
    // Head: first message up to and including the first assistant reply.
    let head_end = messages
        .iter()
        .position(|m| m.role == Role::Assistant)
        .map(|i| i + 1)
        .unwrap_or(1);

    // Tail: last 20 messages, with the start advanced onto a user role so the
    // result still alternates after the synthetic assistant ack.
    let mut tail_start = messages.len() - COMPACTION_KEEP_TAIL;
    while tail_start < messages.len() && messages[tail_start].role != Role::User {
        tail_start += 1;
    }
    if tail_start >= messages.len() || tail_start <= head_end {
        return None;
    }

    let dropped = messages[head_end..tail_start].to_vec();
    if dropped.is_empty() {
        return None;
    }
    Some(CompactionPlan {
        head_end,
        tail_start,
        dropped,
    })
}

/// Replace the planned range with the synthetic placeholder pair and return
/// the placeholder content (persisted as the fallback summary).
pub fn apply_compaction(messages: &mut Vec<TranscriptMessage>, plan: &CompactionPlan) -> String {
    let placeholder = format!(
        "[{} earlier messages compacted to save context]",
        plan.dropped.len()
    );
    messages.splice(
        plan.head_end..plan.tail_start,
        [
            TranscriptMessage::user(placeholder.clone()),
            TranscriptMessage::assistant(COMPACTION_ACK),
        ],
    );
    placeholder
}

/// Serialize the dropped slice for the summarization prompt.
///
/// Text blocks go in verbatim; tool traffic is abbreviated (inputs to 300
/// chars, results to 200); the whole rendering is capped at 30 000 chars
/// keeping 25% head + 75% tail, since the most recent context matters most.
pub fn serialize_dropped(dropped: &[TranscriptMessage]) -> String {
    let rendered = dropped
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let body = if m.blocks.is_empty() {
                m.content.clone()
            } else {
                m.blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.clone(),
                        ContentBlock::ToolUse { name, input, .. } => {
                            let args = Value::Object(input.clone()).to_string();
                            format!("[tool_use: {name}({})]", clip(&args, TOOL_INPUT_CLIP))
                        }
                        ContentBlock::ToolResult {
                            name,
                            result,
                            is_error,
                            ..
                        } => {
                            let marker = if *is_error { " (error)" } else { "" };
                            format!(
                                "[tool_result: {name}{marker}: {}]",
                                clip(result, TOOL_RESULT_CLIP)
                            )
                        }
                        ContentBlock::Compaction { summary_text } => summary_text.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    if rendered.len() <= SERIALIZED_CLIP {
        return rendered;
    }
    let head_budget = SERIALIZED_CLIP / 4;
    let tail_budget = SERIALIZED_CLIP - head_budget;
    let head = clip(&rendered, head_budget);
    let tail = clip_end(&rendered, tail_budget);
    format!("{head}\n[... middle truncated ...]\n{tail}")
}

/// Byte-budget prefix clipped back to a char boundary.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Byte-budget suffix advanced to a char boundary.
fn clip_end(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
