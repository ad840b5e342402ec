// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `ask_user` tool.
//!
//! The only tool that blocks on a human.  Execution sends an
//! [`AskUserRequest`] over the channel whose receiving end is drained by the
//! agent loop; the loop surfaces it to the adapter and the adapter writes
//! exactly one string back.  The agent constructing the registry must hold
//! the paired receiver, otherwise every call fails immediately.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::tool::{Tool, ToolCall, ToolContext, ToolKind, ToolOutput};

/// One pending question for the human operator.
#[derive(Debug)]
pub struct AskUserRequest {
    pub prompt: String,
    /// The adapter writes exactly one answer here.
    pub reply: mpsc::Sender<String>,
}

pub struct AskUserTool {
    requests: mpsc::Sender<AskUserRequest>,
}

impl AskUserTool {
    /// Create the tool and the receiver the agent loop must drain.
    pub fn channel() -> (Self, mpsc::Receiver<AskUserRequest>) {
        let (tx, rx) = mpsc::channel(8);
        (Self { requests: tx }, rx)
    }
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their answer. \
         Use this when you need a decision or information only the user has."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The question to ask" }
            },
            "required": ["question"]
        })
    }

    // Blocks on human input; must never run alongside other tools.
    fn kind(&self) -> ToolKind {
        ToolKind::Sequential
    }

    async fn execute(&self, call: &ToolCall, _cx: &ToolContext) -> ToolOutput {
        let question = match call.require_str("question") {
            Ok(q) => q.to_string(),
            Err(e) => return ToolOutput::err(e),
        };
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        if self
            .requests
            .send(AskUserRequest {
                prompt: question,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return ToolOutput::err("no adapter is listening for questions");
        }
        match reply_rx.recv().await {
            Some(answer) => ToolOutput::ok(answer),
            // The adapter dropped the reply sender without answering — the
            // turn was cancelled.
            None => ToolOutput::err("cancelled"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
