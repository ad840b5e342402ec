// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use otto_model::Provider;
use otto_store::MemoryStore;
use otto_tools::{
    ListFilesTool, ReadFileTool, ShellTool, Tool, ToolCall, ToolContext, ToolOutput,
    ToolRegistry, WriteFileTool,
};

use crate::agent::{AgentOptions, AgentService};
use crate::events::AgentEvent;

const MAX_DEPTH: usize = 3;

/// The `task` tool: delegates a focused sub-task to an inner agent.
///
/// The sub-agent consumes an immutable snapshot of its parent's
/// configuration — provider, working directory, disabled tools — never a
/// live reference, so there is no shared mutable state between parent and
/// child.  Its transcript is scoped to the single turn and discarded.
pub struct TaskTool {
    provider: Arc<dyn Provider>,
    opts: AgentOptions,
    depth: Arc<AtomicUsize>,
}

impl TaskTool {
    pub fn new(provider: Arc<dyn Provider>, opts: AgentOptions, depth: Arc<AtomicUsize>) -> Self {
        Self {
            provider,
            opts,
            depth,
        }
    }

    fn sub_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ListFilesTool);
        reg.register(ReadFileTool);
        reg.register(WriteFileTool);
        reg.register(ShellTool::default());
        // No ask_user (a sub-agent has no adapter to answer) and no task
        // tool beyond the depth guard.
        reg
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text output. \
         Useful for delegating isolated sub-tasks."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                }
            },
            "required": ["prompt"]
        })
    }

    fn writes(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _cx: &ToolContext) -> ToolOutput {
        let prompt = match call.require_str("prompt") {
            Ok(p) => p.to_string(),
            Err(e) => return ToolOutput::err(e),
        };

        let current = self.depth.load(Ordering::Relaxed);
        if current >= MAX_DEPTH {
            return ToolOutput::err(format!("maximum sub-agent depth ({MAX_DEPTH}) reached"));
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(depth = current + 1, "spawning sub-agent");

        let result = self.run_sub_agent(prompt).await;
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(text) if text.is_empty() => ToolOutput::ok("(sub-agent produced no text output)"),
            Ok(text) => ToolOutput::ok(text),
            Err(e) => ToolOutput::err(format!("sub-agent error: {e}")),
        }
    }
}

impl TaskTool {
    async fn run_sub_agent(&self, prompt: String) -> anyhow::Result<String> {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Self::sub_registry());
        // Dropping the ask sender immediately makes any stray ask_user call
        // fail fast instead of hanging.
        let (_ask_tx, ask_rx) = mpsc::channel(1);
        let service = AgentService::new(store, Arc::clone(&self.provider), registry, ask_rx, self.opts.clone())?;
        service.set_titled(true).await;

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let collector = tokio::spawn(async move {
            let mut text = String::new();
            while let Some(ev) = rx.recv().await {
                if let AgentEvent::Delta(t) = ev {
                    text.push_str(&t);
                }
            }
            text
        });
        service.submit(&prompt, tx).await?;
        Ok(collector.await.unwrap_or_default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_model::ScriptedProvider;
    use serde_json::Map;

    fn prompt_call(p: &str) -> ToolCall {
        let mut input = Map::new();
        input.insert("prompt".into(), json!(p));
        ToolCall {
            id: "t1".into(),
            name: "task".into(),
            input,
        }
    }

    #[tokio::test]
    async fn sub_agent_returns_streamed_text() {
        let provider = Arc::new(ScriptedProvider::always_text("sub-agent answer"));
        let tool = TaskTool::new(provider, AgentOptions::default(), Arc::new(AtomicUsize::new(0)));
        let out = tool
            .execute(&prompt_call("do the thing"), &ToolContext::default())
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(out.content, "sub-agent answer");
    }

    #[tokio::test]
    async fn depth_limit_is_enforced() {
        let provider = Arc::new(ScriptedProvider::always_text("x"));
        let tool = TaskTool::new(
            provider,
            AgentOptions::default(),
            Arc::new(AtomicUsize::new(MAX_DEPTH)),
        );
        let out = tool
            .execute(&prompt_call("too deep"), &ToolContext::default())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("depth"));
    }

    #[tokio::test]
    async fn missing_prompt_is_tool_error() {
        let provider = Arc::new(ScriptedProvider::always_text("x"));
        let tool = TaskTool::new(provider, AgentOptions::default(), Arc::new(AtomicUsize::new(0)));
        let call = ToolCall {
            id: "t1".into(),
            name: "task".into(),
            input: Map::new(),
        };
        let out = tool.execute(&call, &ToolContext::default()).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required field"));
    }
}
