// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use otto_model::{ContentBlock, Role};

/// Session metadata.  One session is attached to at most one agent service
/// at a time; deletion cascades to its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub project_path: String,
    pub model: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub message_count: u64,
    /// Fork origin, when this session was branched from another.
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub branch_point: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            project_path: String::new(),
            model: String::new(),
            title: String::new(),
            tags: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            message_count: 0,
            parent_session_id: None,
            branch_point: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One persisted transcript message.  `blocks` is empty for plain text; the
/// serialized form round-trips through serde_json without loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sequence: u64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
    #[serde(default)]
    pub tokens: u64,
}

/// One compaction checkpoint.  The latest record wins; on resume, messages
/// at or below `cutoff_sequence` are replaced by the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub session_id: String,
    pub summary_text: String,
    pub cutoff_sequence: u64,
}

/// Storage contract required by the agent core.
///
/// Implementations guarantee single-writer semantics internally; callers may
/// share one store across many sessions.  All operations are synchronous —
/// implementations are local and fast, and the core treats append failures
/// as non-fatal (logged, turn continues).
pub trait Store: Send + Sync {
    fn create_session(&self, project_path: &str, model: &str) -> anyhow::Result<SessionRecord>;
    fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;
    fn list_sessions(&self) -> anyhow::Result<Vec<SessionRecord>>;
    /// Removes the session and cascades to its messages and compactions.
    fn delete_session(&self, session_id: &str) -> anyhow::Result<()>;
    /// New session whose messages are a copy of the source's first `at_seq`
    /// messages; parent linkage is recorded on the new record.
    fn branch_session(&self, from_session_id: &str, at_seq: u64)
        -> anyhow::Result<SessionRecord>;

    /// Appends a plain-text message and returns its assigned sequence.
    fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tokens: u64,
    ) -> anyhow::Result<u64>;
    /// Appends a structured message and returns its assigned sequence.
    fn append_message_blocks(
        &self,
        session_id: &str,
        role: Role,
        blocks: &[ContentBlock],
        tokens: u64,
    ) -> anyhow::Result<u64>;
    fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>>;
    /// Suffix of the transcript, used with the compaction cutoff.
    fn get_messages_after_sequence(
        &self,
        session_id: &str,
        seq: u64,
    ) -> anyhow::Result<Vec<StoredMessage>>;
    /// Highest assigned sequence; 0 when the transcript is empty.
    fn message_max_sequence(&self, session_id: &str) -> anyhow::Result<u64>;

    fn save_compaction(&self, session_id: &str, summary: &str, cutoff: u64)
        -> anyhow::Result<()>;
    fn latest_compaction(&self, session_id: &str) -> anyhow::Result<Option<CompactionRecord>>;

    /// Adds this turn's token counts to the session counters.
    fn update_session_tokens(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> anyhow::Result<()>;
    fn update_session_title(&self, session_id: &str, title: &str) -> anyhow::Result<()>;
    fn update_session_model(&self, session_id: &str, model: &str) -> anyhow::Result<()>;
    fn update_session_tags(&self, session_id: &str, tags: &[String]) -> anyhow::Result<()>;
}
