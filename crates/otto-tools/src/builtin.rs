// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The built-in tool set.
//!
//! Deliberately small: enough for an agent to inspect and edit a project and
//! run commands.  Heavier tools (search, web access) plug in through the same
//! [`Tool`] trait from the embedding application.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolContext, ToolKind, ToolOutput};

// ─── list_files ───────────────────────────────────────────────────────────────

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are suffixed with '/'."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: .)" }
            }
        })
    }

    async fn execute(&self, call: &ToolCall, cx: &ToolContext) -> ToolOutput {
        let path = cx.resolve(call.opt_str("path").unwrap_or("."));
        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::err(format!("cannot list {}: {e}", path.display())),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        ToolOutput::ok(names.join("\n"))
    }
}

// ─── read_file ────────────────────────────────────────────────────────────────

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to read" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, call: &ToolCall, cx: &ToolContext) -> ToolOutput {
        let path = match call.require_str("path") {
            Ok(p) => cx.resolve(p),
            Err(e) => return ToolOutput::err(e),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => ToolOutput::ok(content),
            Err(e) => ToolOutput::err(format!("cannot read {}: {e}", path.display())),
        }
    }
}

// ─── write_file ───────────────────────────────────────────────────────────────

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn writes(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, cx: &ToolContext) -> ToolOutput {
        let path = match call.require_str("path") {
            Ok(p) => cx.resolve(p),
            Err(e) => return ToolOutput::err(e),
        };
        let content = match call.require_str("content") {
            Ok(c) => c.to_string(),
            Err(e) => return ToolOutput::err(e),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(format!("cannot create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(&path, &content).await {
            Ok(()) => ToolOutput::ok(format!("wrote {} bytes to {}", content.len(), path.display())),
            Err(e) => ToolOutput::err(format!("cannot write {}: {e}", path.display())),
        }
    }
}

// ─── shell ────────────────────────────────────────────────────────────────────

pub struct ShellTool {
    pub timeout_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the project directory and return stdout + stderr."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command to run via sh -c" }
            },
            "required": ["command"]
        })
    }

    // Commands mutate process-wide state (files, env, ports); never run them
    // alongside other tools.
    fn kind(&self) -> ToolKind {
        ToolKind::Sequential
    }

    fn writes(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, cx: &ToolContext) -> ToolOutput {
        let command = match call.require_str("command") {
            Ok(c) => c.to_string(),
            Err(e) => return ToolOutput::err(e),
        };
        let fut = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cx.cwd)
            .output();
        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            fut,
        )
        .await
        {
            Err(_) => {
                return ToolOutput::err(format!(
                    "command timed out after {}s: {command}",
                    self.timeout_secs
                ))
            }
            Ok(Err(e)) => return ToolOutput::err(format!("cannot spawn sh: {e}")),
            Ok(Ok(o)) => o,
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if output.status.success() {
            ToolOutput::ok(text)
        } else {
            ToolOutput::err(format!(
                "exit status {}: {text}",
                output.status.code().unwrap_or(-1)
            ))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
