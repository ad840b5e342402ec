// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::tool::{Tool, ToolCall, ToolContext, ToolKind, ToolOutput};

/// A tool definition as advertised to the model.  Mirrors the model crate's
/// spec shape without depending on it, keeping this crate standalone.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry of available tools.  Immutable after construction, so
/// parallel execution needs no further synchronization.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for every tool not masked out, sorted by name for a stable
    /// wire order.  `plan_mode` additionally drops write-capable tools.
    pub fn schemas(&self, disabled: &HashSet<String>, plan_mode: bool) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| !disabled.contains(t.name()))
            .filter(|t| !(plan_mode && t.writes()))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Whether a call to `name` is dispatchable under the given mask.  A tool
    /// that is unknown, disabled, or write-capable in plan mode all answer
    /// the model the same way, so callers need only one predicate.
    pub fn is_available(&self, name: &str, disabled: &HashSet<String>, plan_mode: bool) -> bool {
        match self.tools.get(name) {
            Some(t) => !disabled.contains(name) && !(plan_mode && t.writes()),
            None => false,
        }
    }

    pub fn kind(&self, name: &str) -> ToolKind {
        self.tools
            .get(name)
            .map(|t| t.kind())
            .unwrap_or(ToolKind::Parallel)
    }

    pub async fn execute(&self, call: &ToolCall, cx: &ToolContext) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call, cx).await,
            None => ToolOutput::err(format!("Unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::*;

    struct EchoTool {
        name: &'static str,
        writes: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn writes(&self) -> bool {
            self.writes
        }
        async fn execute(&self, call: &ToolCall, _cx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(format!("echo:{}", Value::Object(call.input.clone())))
        }
    }

    fn reg() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(EchoTool {
            name: "echo",
            writes: false,
        });
        r.register(EchoTool {
            name: "write_file",
            writes: true,
        });
        r
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: name.into(),
            input: Map::new(),
        }
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let out = reg().execute(&call("echo"), &ToolContext::default()).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_reports_name() {
        let out = reg().execute(&call("nope"), &ToolContext::default()).await;
        assert!(out.is_error);
        assert_eq!(out.content, "Unknown tool: nope");
    }

    #[test]
    fn schemas_sorted_and_complete() {
        let schemas = reg().schemas(&HashSet::new(), false);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "write_file"]);
    }

    #[test]
    fn disabled_mask_drops_tools_from_schemas() {
        let disabled: HashSet<String> = ["echo".to_string()].into();
        let schemas = reg().schemas(&disabled, false);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "write_file");
    }

    #[test]
    fn plan_mode_drops_write_capable_tools() {
        let schemas = reg().schemas(&HashSet::new(), true);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo"]);
    }

    #[test]
    fn availability_matches_mask_and_mode() {
        let r = reg();
        let none = HashSet::new();
        let disabled: HashSet<String> = ["echo".to_string()].into();
        assert!(r.is_available("echo", &none, false));
        assert!(!r.is_available("echo", &disabled, false));
        assert!(!r.is_available("write_file", &none, true));
        assert!(!r.is_available("missing", &none, false));
    }
}
