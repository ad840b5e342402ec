// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Whether a tool may run alongside others in the same batch.
///
/// A tool is `Sequential` when its contract requires mutual exclusion with
/// every other tool: it blocks on human input, or it mutates global process
/// state.  Everything else is `Parallel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolKind {
    Sequential,
    #[default]
    Parallel,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim into the result.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub input: Map<String, Value>,
}

impl ToolCall {
    /// Extract a required string field, or produce the structured
    /// "missing/invalid field" message surfaced as a regular tool error.
    pub fn require_str(&self, field: &str) -> Result<&str, String> {
        match self.input.get(field) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(format!(
                "invalid field {field:?}: expected string, got {other}"
            )),
            None => Err(format!("missing required field {field:?}")),
        }
    }

    /// Extract an optional string field.
    pub fn opt_str(&self, field: &str) -> Option<&str> {
        self.input.get(field).and_then(|v| v.as_str())
    }
}

/// The result of executing a tool.  Failures are captured here, never as
/// panics or transport errors — the model is expected to read the message and
/// recover.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Ambient context handed to every tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Working directory all relative paths resolve against.
    pub cwd: PathBuf,
}

impl ToolContext {
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.cwd.join(p)
        }
    }
}

/// Trait every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    fn kind(&self) -> ToolKind {
        ToolKind::Parallel
    }
    /// Write-capable tools are rejected while the session is in plan mode.
    fn writes(&self) -> bool {
        false
    }
    /// Execute the tool.  Failures are wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall, cx: &ToolContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
