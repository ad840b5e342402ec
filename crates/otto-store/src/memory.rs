// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use anyhow::bail;
use chrono::Utc;
use parking_lot::RwLock;

use otto_model::{ContentBlock, Role};

use crate::store::{CompactionRecord, SessionRecord, Store, StoredMessage};

#[derive(Default, Clone)]
struct SessionData {
    record: SessionRecord,
    messages: Vec<StoredMessage>,
    compactions: Vec<CompactionRecord>,
}

/// In-memory store.  The reference implementation used by tests, sub-agents,
/// and dry runs; the JSON store layers persistence on the same shape.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionData) -> R,
    ) -> anyhow::Result<R> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(data) => Ok(f(data)),
            None => bail!("no such session: {session_id}"),
        }
    }

    fn append(
        &self,
        session_id: &str,
        role: Role,
        content: String,
        blocks: Vec<ContentBlock>,
        tokens: u64,
    ) -> anyhow::Result<u64> {
        self.with_session(session_id, |data| {
            let sequence = data.messages.last().map(|m| m.sequence).unwrap_or(0) + 1;
            data.messages.push(StoredMessage {
                sequence,
                role,
                content,
                blocks,
                tokens,
            });
            data.record.message_count = data.messages.len() as u64;
            data.record.updated_at = Utc::now();
            sequence
        })
    }
}

impl Store for MemoryStore {
    fn create_session(&self, project_path: &str, model: &str) -> anyhow::Result<SessionRecord> {
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_path: project_path.to_string(),
            model: model.to_string(),
            title: "Untitled session".to_string(),
            ..SessionRecord::default()
        };
        self.sessions.write().insert(
            record.id.clone(),
            SessionData {
                record: record.clone(),
                ..SessionData::default()
            },
        );
        Ok(record)
    }

    fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .map(|d| d.record.clone()))
    }

    fn list_sessions(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let mut out: Vec<SessionRecord> = self
            .sessions
            .read()
            .values()
            .map(|d| d.record.clone())
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        if self.sessions.write().remove(session_id).is_none() {
            bail!("no such session: {session_id}");
        }
        Ok(())
    }

    fn branch_session(
        &self,
        from_session_id: &str,
        at_seq: u64,
    ) -> anyhow::Result<SessionRecord> {
        let mut sessions = self.sessions.write();
        let Some(source) = sessions.get(from_session_id).cloned() else {
            bail!("no such session: {from_session_id}");
        };
        let messages: Vec<StoredMessage> = source
            .messages
            .iter()
            .filter(|m| m.sequence <= at_seq)
            .cloned()
            .collect();
        let now = Utc::now();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: format!("{} (branch)", source.record.title),
            tags: source.record.tags.clone(),
            message_count: messages.len() as u64,
            parent_session_id: Some(from_session_id.to_string()),
            branch_point: Some(at_seq),
            created_at: now,
            updated_at: now,
            input_tokens: 0,
            output_tokens: 0,
            project_path: source.record.project_path.clone(),
            model: source.record.model.clone(),
        };
        sessions.insert(
            record.id.clone(),
            SessionData {
                record: record.clone(),
                messages,
                compactions: Vec::new(),
            },
        );
        Ok(record)
    }

    fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tokens: u64,
    ) -> anyhow::Result<u64> {
        self.append(session_id, role, content.to_string(), Vec::new(), tokens)
    }

    fn append_message_blocks(
        &self,
        session_id: &str,
        role: Role,
        blocks: &[ContentBlock],
        tokens: u64,
    ) -> anyhow::Result<u64> {
        let content = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        self.append(session_id, role, content, blocks.to_vec(), tokens)
    }

    fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        self.with_session(session_id, |d| d.messages.clone())
    }

    fn get_messages_after_sequence(
        &self,
        session_id: &str,
        seq: u64,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        self.with_session(session_id, |d| {
            d.messages
                .iter()
                .filter(|m| m.sequence > seq)
                .cloned()
                .collect()
        })
    }

    fn message_max_sequence(&self, session_id: &str) -> anyhow::Result<u64> {
        self.with_session(session_id, |d| {
            d.messages.last().map(|m| m.sequence).unwrap_or(0)
        })
    }

    fn save_compaction(
        &self,
        session_id: &str,
        summary: &str,
        cutoff: u64,
    ) -> anyhow::Result<()> {
        self.with_session(session_id, |d| {
            d.compactions.push(CompactionRecord {
                session_id: session_id.to_string(),
                summary_text: summary.to_string(),
                cutoff_sequence: cutoff,
            });
        })
    }

    fn latest_compaction(&self, session_id: &str) -> anyhow::Result<Option<CompactionRecord>> {
        self.with_session(session_id, |d| d.compactions.last().cloned())
    }

    fn update_session_tokens(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> anyhow::Result<()> {
        self.with_session(session_id, |d| {
            d.record.input_tokens += input_tokens;
            d.record.output_tokens += output_tokens;
            d.record.updated_at = Utc::now();
        })
    }

    fn update_session_title(&self, session_id: &str, title: &str) -> anyhow::Result<()> {
        self.with_session(session_id, |d| {
            d.record.title = title.to_string();
            d.record.updated_at = Utc::now();
        })
    }

    fn update_session_model(&self, session_id: &str, model: &str) -> anyhow::Result<()> {
        self.with_session(session_id, |d| {
            d.record.model = model.to_string();
            d.record.updated_at = Utc::now();
        })
    }

    fn update_session_tags(&self, session_id: &str, tags: &[String]) -> anyhow::Result<()> {
        self.with_session(session_id, |d| {
            d.record.tags = tags.to_vec();
            d.record.updated_at = Utc::now();
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_assigns_unique_ids() {
        let s = MemoryStore::new();
        let a = s.create_session("/p", "anthropic/claude").unwrap();
        let b = s.create_session("/p", "anthropic/claude").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.title, "Untitled session");
    }

    #[test]
    fn sequences_start_at_one_and_increment() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        assert_eq!(s.message_max_sequence(&sess.id).unwrap(), 0);
        assert_eq!(s.append_message(&sess.id, Role::User, "a", 1).unwrap(), 1);
        assert_eq!(
            s.append_message(&sess.id, Role::Assistant, "b", 1).unwrap(),
            2
        );
        assert_eq!(s.message_max_sequence(&sess.id).unwrap(), 2);
    }

    #[test]
    fn blocks_round_trip_through_append() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        let blocks = vec![
            ContentBlock::text("hi"),
            ContentBlock::tool_use("u1", "shell", serde_json::Map::new()),
        ];
        s.append_message_blocks(&sess.id, Role::Assistant, &blocks, 3)
            .unwrap();
        let msgs = s.get_messages(&sess.id).unwrap();
        assert_eq!(msgs[0].blocks, blocks);
        assert_eq!(msgs[0].content, "hi");
    }

    #[test]
    fn messages_after_sequence_returns_suffix() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        for i in 0..5 {
            s.append_message(&sess.id, Role::User, &format!("m{i}"), 1)
                .unwrap();
        }
        let tail = s.get_messages_after_sequence(&sess.id, 3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 4);
    }

    #[test]
    fn latest_compaction_wins() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        assert!(s.latest_compaction(&sess.id).unwrap().is_none());
        s.save_compaction(&sess.id, "first", 10).unwrap();
        s.save_compaction(&sess.id, "second", 20).unwrap();
        let c = s.latest_compaction(&sess.id).unwrap().unwrap();
        assert_eq!(c.summary_text, "second");
        assert_eq!(c.cutoff_sequence, 20);
    }

    #[test]
    fn branch_copies_message_prefix_and_links_parent() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        for i in 0..4 {
            s.append_message(&sess.id, Role::User, &format!("m{i}"), 1)
                .unwrap();
        }
        let branch = s.branch_session(&sess.id, 2).unwrap();
        assert_eq!(branch.parent_session_id.as_deref(), Some(sess.id.as_str()));
        assert_eq!(branch.branch_point, Some(2));
        let msgs = s.get_messages(&branch.id).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "m1");
    }

    #[test]
    fn delete_session_cascades() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        s.append_message(&sess.id, Role::User, "x", 1).unwrap();
        s.delete_session(&sess.id).unwrap();
        assert!(s.get_session(&sess.id).unwrap().is_none());
        assert!(s.get_messages(&sess.id).is_err());
    }

    #[test]
    fn token_counters_accumulate() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        s.update_session_tokens(&sess.id, 100, 50).unwrap();
        s.update_session_tokens(&sess.id, 10, 5).unwrap();
        let r = s.get_session(&sess.id).unwrap().unwrap();
        assert_eq!(r.input_tokens, 110);
        assert_eq!(r.output_tokens, 55);
    }

    #[test]
    fn metadata_updates_apply() {
        let s = MemoryStore::new();
        let sess = s.create_session("/p", "m").unwrap();
        s.update_session_title(&sess.id, "Fix the parser").unwrap();
        s.update_session_tags(&sess.id, &["rust".into(), "parser".into()])
            .unwrap();
        s.update_session_model(&sess.id, "anthropic/claude-sonnet-4-5")
            .unwrap();
        let r = s.get_session(&sess.id).unwrap().unwrap();
        assert_eq!(r.title, "Fix the parser");
        assert_eq!(r.tags, vec!["rust", "parser"]);
        assert_eq!(r.model, "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn unknown_session_operations_error() {
        let s = MemoryStore::new();
        assert!(s.append_message("nope", Role::User, "x", 1).is_err());
        assert!(s.delete_session("nope").is_err());
        assert!(s.branch_session("nope", 1).is_err());
    }
}
