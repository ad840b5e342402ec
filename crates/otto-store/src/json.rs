// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-file-backed store.
//!
//! Persists all sessions of one store into a single `sessions.json` under the
//! state directory.  Every mutation rewrites the file through a temp-file
//! rename, so readers never observe a half-written state.  Suitable for a
//! single process; the in-process `RwLock` provides the single-writer
//! guarantee.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use otto_model::{ContentBlock, Role};

use crate::store::{CompactionRecord, SessionRecord, Store, StoredMessage};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionData {
    record: SessionRecord,
    messages: Vec<StoredMessage>,
    compactions: Vec<CompactionRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    sessions: HashMap<String, SessionData>,
}

pub struct JsonStore {
    path: PathBuf,
    state: RwLock<State>,
}

impl JsonStore {
    /// Load or create the store at `state_dir/sessions.json`.
    pub fn open(state_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating {}", state_dir.display()))?;
        let path = state_dir.join("sessions.json");
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            State::default()
        };
        tracing::info!(path = %path.display(), "session store loaded");
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &State) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let mut state = self.state.write();
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }

    fn mutate_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionData) -> R,
    ) -> anyhow::Result<R> {
        self.mutate(|state| match state.sessions.get_mut(session_id) {
            Some(data) => Ok(f(data)),
            None => bail!("no such session: {session_id}"),
        })
    }

    fn read_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&SessionData) -> R,
    ) -> anyhow::Result<R> {
        let state = self.state.read();
        match state.sessions.get(session_id) {
            Some(data) => Ok(f(data)),
            None => bail!("no such session: {session_id}"),
        }
    }
}

impl Store for JsonStore {
    fn create_session(&self, project_path: &str, model: &str) -> anyhow::Result<SessionRecord> {
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_path: project_path.to_string(),
            model: model.to_string(),
            title: "Untitled session".to_string(),
            ..SessionRecord::default()
        };
        let r = record.clone();
        self.mutate(move |state| {
            state.sessions.insert(
                record.id.clone(),
                SessionData {
                    record,
                    ..SessionData::default()
                },
            );
            Ok(())
        })?;
        Ok(r)
    }

    fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self
            .state
            .read()
            .sessions
            .get(session_id)
            .map(|d| d.record.clone()))
    }

    fn list_sessions(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let mut out: Vec<SessionRecord> = self
            .state
            .read()
            .sessions
            .values()
            .map(|d| d.record.clone())
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.mutate(|state| {
            if state.sessions.remove(session_id).is_none() {
                bail!("no such session: {session_id}");
            }
            Ok(())
        })
    }

    fn branch_session(
        &self,
        from_session_id: &str,
        at_seq: u64,
    ) -> anyhow::Result<SessionRecord> {
        self.mutate(|state| {
            let Some(source) = state.sessions.get(from_session_id).cloned() else {
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
            state.sessions.insert(
                record.id.clone(),
                SessionData {
                    record: record.clone(),
                    messages,
                    compactions: Vec::new(),
                },
            );
            Ok(record)
        })
    }

    fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tokens: u64,
    ) -> anyhow::Result<u64> {
        self.mutate_session(session_id, |data| {
            let sequence = data.messages.last().map(|m| m.sequence).unwrap_or(0) + 1;
            data.messages.push(StoredMessage {
                sequence,
                role,
                content: content.to_string(),
                blocks: Vec::new(),
                tokens,
            });
            data.record.message_count = data.messages.len() as u64;
            data.record.updated_at = Utc::now();
            sequence
        })
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
        self.mutate_session(session_id, |data| {
            let sequence = data.messages.last().map(|m| m.sequence).unwrap_or(0) + 1;
            data.messages.push(StoredMessage {
                sequence,
                role,
                content,
                blocks: blocks.to_vec(),
                tokens,
            });
            data.record.message_count = data.messages.len() as u64;
            data.record.updated_at = Utc::now();
            sequence
        })
    }

    fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        self.read_session(session_id, |d| d.messages.clone())
    }

    fn get_messages_after_sequence(
        &self,
        session_id: &str,
        seq: u64,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        self.read_session(session_id, |d| {
            d.messages
                .iter()
                .filter(|m| m.sequence > seq)
                .cloned()
                .collect()
        })
    }

    fn message_max_sequence(&self, session_id: &str) -> anyhow::Result<u64> {
        self.read_session(session_id, |d| {
            d.messages.last().map(|m| m.sequence).unwrap_or(0)
        })
    }

    fn save_compaction(
        &self,
        session_id: &str,
        summary: &str,
        cutoff: u64,
    ) -> anyhow::Result<()> {
        self.mutate_session(session_id, |d| {
            d.compactions.push(CompactionRecord {
                session_id: session_id.to_string(),
                summary_text: summary.to_string(),
                cutoff_sequence: cutoff,
            });
        })
    }

    fn latest_compaction(&self, session_id: &str) -> anyhow::Result<Option<CompactionRecord>> {
        self.read_session(session_id, |d| d.compactions.last().cloned())
    }

    fn update_session_tokens(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> anyhow::Result<()> {
        self.mutate_session(session_id, |d| {
            d.record.input_tokens += input_tokens;
            d.record.output_tokens += output_tokens;
            d.record.updated_at = Utc::now();
        })
    }

    fn update_session_title(&self, session_id: &str, title: &str) -> anyhow::Result<()> {
        self.mutate_session(session_id, |d| {
            d.record.title = title.to_string();
            d.record.updated_at = Utc::now();
        })
    }

    fn update_session_model(&self, session_id: &str, model: &str) -> anyhow::Result<()> {
        self.mutate_session(session_id, |d| {
            d.record.model = model.to_string();
            d.record.updated_at = Utc::now();
        })
    }

    fn update_session_tags(&self, session_id: &str, tags: &[String]) -> anyhow::Result<()> {
        self.mutate_session(session_id, |d| {
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
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let sid = {
            let store = JsonStore::open(dir.path()).unwrap();
            let sess = store.create_session("/p", "anthropic/claude").unwrap();
            store
                .append_message(&sess.id, Role::User, "hello", 2)
                .unwrap();
            store.save_compaction(&sess.id, "summary", 1).unwrap();
            sess.id
        };
        let store = JsonStore::open(dir.path()).unwrap();
        let record = store.get_session(&sid).unwrap().unwrap();
        assert_eq!(record.message_count, 1);
        let msgs = store.get_messages(&sid).unwrap();
        assert_eq!(msgs[0].content, "hello");
        let c = store.latest_compaction(&sid).unwrap().unwrap();
        assert_eq!(c.summary_text, "summary");
    }

    #[test]
    fn blocks_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let sess = store.create_session("/p", "m").unwrap();
        let blocks = vec![ContentBlock::tool_result("u1", "shell", "ok", false)];
        store
            .append_message_blocks(&sess.id, Role::User, &blocks, 1)
            .unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        let msgs = reopened.get_messages(&sess.id).unwrap();
        assert_eq!(msgs[0].blocks, blocks);
    }

    #[test]
    fn corrupt_file_resets_to_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sessions.json"), "{ not json").unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn branch_persists_copied_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let sess = store.create_session("/p", "m").unwrap();
        for i in 0..3 {
            store
                .append_message(&sess.id, Role::User, &format!("m{i}"), 1)
                .unwrap();
        }
        let branch = store.branch_session(&sess.id, 2).unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        let msgs = reopened.get_messages(&branch.id).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            reopened
                .get_session(&branch.id)
                .unwrap()
                .unwrap()
                .parent_session_id
                .as_deref(),
            Some(sess.id.as_str())
        );
    }
}
