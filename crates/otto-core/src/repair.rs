// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Idempotent cleanup of dangling tool-use / tool-result pairs.
//!
//! A cancellation or crash can leave an assistant `tool_use` without the
//! answering `tool_result` user message (or with a partial one).  Providers
//! reject such transcripts, so the repair runs on resume and before every
//! submit: any assistant message with at least one unmatched `tool_use` is
//! dropped entirely, together with its partial answer.

use std::collections::HashSet;

use otto_model::{Role, TranscriptMessage};
use tracing::debug;

/// Repair in place.  Returns `true` when anything was dropped.
///
/// On return, every assistant message containing `tool_use` blocks is
/// directly followed by a user message whose `tool_result` ids are exactly
/// the matching id set.
pub fn repair_transcript(messages: &mut Vec<TranscriptMessage>) -> bool {
    let mut out: Vec<TranscriptMessage> = Vec::with_capacity(messages.len());
    let mut changed = false;
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if m.role == Role::Assistant && m.has_tool_use() {
            let use_ids: HashSet<&str> = m.tool_uses().map(|(id, _, _)| id).collect();
            let answered = messages
                .get(i + 1)
                .map(|next| {
                    next.role == Role::User
                        && next.tool_result_ids().into_iter().collect::<HashSet<_>>() == use_ids
                })
                .unwrap_or(false);
            if answered {
                out.push(messages[i].clone());
                out.push(messages[i + 1].clone());
                i += 2;
                continue;
            }
            debug!(
                tool_use_count = use_ids.len(),
                "dropping assistant message with unmatched tool_use"
            );
            changed = true;
            // Take the partial answer down with it.
            let partial_answer = messages
                .get(i + 1)
                .map(|next| {
                    next.role == Role::User
                        && next.has_tool_result()
                        && next
                            .tool_result_ids()
                            .iter()
                            .all(|id| use_ids.contains(id))
                })
                .unwrap_or(false);
            i += if partial_answer { 2 } else { 1 };
            continue;
        }

        // A tool_result user message whose assistant was dropped (or never
        // existed) would poison the transcript the same way.
        if m.role == Role::User && m.has_tool_result() {
            let matches_prev = out
                .last()
                .map(|prev| {
                    prev.role == Role::Assistant && {
                        let use_ids: HashSet<&str> =
                            prev.tool_uses().map(|(id, _, _)| id).collect();
                        m.tool_result_ids().iter().all(|id| use_ids.contains(id))
                    }
                })
                .unwrap_or(false);
            if !matches_prev {
                debug!("dropping orphaned tool_result message");
                changed = true;
                i += 1;
                continue;
            }
        }

        out.push(m.clone());
        i += 1;
    }

    if changed {
        *messages = out;
    }
    changed
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
