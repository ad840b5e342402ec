// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use tokio::sync::mpsc;

use otto_model::{StopReason, Usage};

/// Events emitted by an agent service during one submit.
///
/// All events of a turn come from a single producer in total order; adapters
/// consume the paired receiver and must not block it beyond best effort.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A streamed text fragment of the assistant response.
    Delta(String),
    /// One provider call finished; carries the stop reason and token usage.
    StreamDone {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// A tool is about to execute.
    ToolStart { id: String, name: String },
    /// A tool finished.
    ToolDone {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// The turn finished successfully.  Final event of a successful turn.
    TurnDone,
    /// The turn failed.  Terminal.
    Error(String),
    /// The middle of the transcript was compacted away.
    Compacted { dropped: usize },
    /// The model asked the user a question.  The adapter writes exactly one
    /// answer into `reply`; dropping it without answering cancels the ask.
    AskUser {
        prompt: String,
        reply: mpsc::Sender<String>,
    },
    /// The session received an auto-generated title.
    Titled(String),
    /// A retryable provider failure; the next attempt starts after `wait`.
    Retrying {
        attempt: u32,
        wait: Duration,
        message: String,
    },
}
