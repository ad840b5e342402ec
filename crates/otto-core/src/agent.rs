// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use otto_model::{
    http, ContentBlock, Provider, ProviderError, Role, Salvage, StopReason, StreamAccumulator,
    StreamOutcome, StreamRequest, ToolSpec, TranscriptMessage, Usage,
};
use otto_store::Store;
use otto_tools::{AskUserRequest, ToolCall, ToolContext, ToolKind, ToolRegistry};

use crate::{
    compact::{
        apply_compaction, plan_compaction, serialize_dropped, CompactionPlan,
        COMPACTION_ACK, COMPACTION_KEEP_TAIL, COMPACTION_TOKEN_THRESHOLD, SUMMARY_PROMPT,
    },
    events::AgentEvent,
    repair::repair_transcript,
    retry::{is_retryable, is_transport_error, retry_message, RetrySchedule},
    tasks::{clean_title, parse_tags, run_text_task, task_model, TAGS_PROMPT, TITLE_PROMPT},
};

/// Iterations (provider calls) allowed per submit.
pub const MAX_ITERATIONS: u32 = 60;

/// Cancellation poll granularity for sleeps and sequential tool waits.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Per-task model overrides.
#[derive(Debug, Clone, Default)]
pub struct TaskModels {
    pub compact: Option<String>,
    pub title: Option<String>,
    pub tags: Option<String>,
}

/// Static configuration of one agent service.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Model id sent in every chat request (the provider is fixed per
    /// service; per-task overrides swap only the model id).
    pub model: String,
    pub system_prompt: String,
    pub cwd: PathBuf,
    pub max_tokens: u32,
    pub task_models: TaskModels,
    pub disabled_tools: HashSet<String>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            model: "mock-model".into(),
            system_prompt: "You are a coding agent.".into(),
            cwd: PathBuf::from("."),
            max_tokens: 4096,
            task_models: TaskModels::default(),
            disabled_tools: HashSet::new(),
        }
    }
}

/// Everything one submit may touch, behind the per-service lock.  The lock
/// is held only for local mutations — never across a provider call, a tool
/// execution, or a retry sleep.
struct ServiceState {
    messages: Vec<TranscriptMessage>,
    last_input_tokens: u64,
    running: bool,
    cancelled: bool,
    titled: bool,
    plan_mode: bool,
    disabled_tools: HashSet<String>,
}

enum StreamCallError {
    Cancelled,
    Provider(ProviderError),
}

/// Drives one session: provider calls, tool dispatch, retry, compaction.
/// Many services coexist in one process, each exclusively owning its session.
pub struct AgentService {
    session_id: String,
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    opts: AgentOptions,
    state: Mutex<ServiceState>,
    /// Receiving end of the channel the `ask_user` tool sends questions on.
    ask_rx: Mutex<mpsc::Receiver<AskUserRequest>>,
}

impl AgentService {
    /// Create a fresh session in the store and attach a service to it.
    ///
    /// `ask_rx` must be the receiver paired with the `ask_user` tool
    /// registered in `tools`, so questions reach the adapter.
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        ask_rx: mpsc::Receiver<AskUserRequest>,
        opts: AgentOptions,
    ) -> anyhow::Result<Self> {
        let model_ref = format!("{}/{}", provider.name(), opts.model);
        let record = store.create_session(&opts.cwd.to_string_lossy(), &model_ref)?;
        Ok(Self::attach(record.id, store, provider, tools, ask_rx, opts, Vec::new(), false))
    }

    /// Attach to an existing session: load the transcript honoring the latest
    /// compaction cutoff, prepend the synthetic summary pair, and repair any
    /// dangling tool calls left by a crash or cancellation.
    pub fn resume(
        session_id: &str,
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        ask_rx: mpsc::Receiver<AskUserRequest>,
        opts: AgentOptions,
    ) -> anyhow::Result<Self> {
        store
            .get_session(session_id)?
            .ok_or_else(|| anyhow::anyhow!("no such session: {session_id}"))?;
        let compaction = store.latest_compaction(session_id)?;
        let stored = match &compaction {
            Some(c) => store.get_messages_after_sequence(session_id, c.cutoff_sequence)?,
            None => store.get_messages(session_id)?,
        };
        let mut messages: Vec<TranscriptMessage> = Vec::with_capacity(stored.len() + 2);
        if let Some(c) = compaction {
            messages.push(TranscriptMessage::user(c.summary_text));
            messages.push(TranscriptMessage::assistant(COMPACTION_ACK));
        }
        messages.extend(stored.into_iter().map(|m| TranscriptMessage {
            role: m.role,
            blocks: m.blocks,
            content: m.content,
        }));
        repair_transcript(&mut messages);
        // Auto-titling only ever runs on the first assistant turn of a fresh
        // session.
        let titled = !messages.is_empty();
        Ok(Self::attach(
            session_id.to_string(),
            store,
            provider,
            tools,
            ask_rx,
            opts,
            messages,
            titled,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        session_id: String,
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        ask_rx: mpsc::Receiver<AskUserRequest>,
        opts: AgentOptions,
        messages: Vec<TranscriptMessage>,
        titled: bool,
    ) -> Self {
        let disabled_tools = opts.disabled_tools.clone();
        Self {
            session_id,
            store,
            provider,
            tools,
            opts,
            state: Mutex::new(ServiceState {
                messages,
                last_input_tokens: 0,
                running: false,
                cancelled: false,
                titled,
                plan_mode: false,
                disabled_tools,
            }),
            ask_rx: Mutex::new(ask_rx),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Request cooperative cancellation.  Safe to call at any time; the turn
    /// ends at its next suspension point.  Already-persisted messages stay.
    pub async fn cancel(&self) {
        self.state.lock().await.cancelled = true;
    }

    pub async fn set_plan_mode(&self, on: bool) {
        self.state.lock().await.plan_mode = on;
    }

    pub async fn set_disabled_tools(&self, disabled: HashSet<String>) {
        self.state.lock().await.disabled_tools = disabled;
    }

    /// Snapshot of the in-memory transcript.
    pub async fn transcript(&self) -> Vec<TranscriptMessage> {
        self.state.lock().await.messages.clone()
    }

    /// Current input-token watermark (reset to 0 by compaction).
    pub async fn last_input_tokens(&self) -> u64 {
        self.state.lock().await.last_input_tokens
    }

    pub async fn is_titled(&self) -> bool {
        self.state.lock().await.titled
    }

    /// Force the titled flag, e.g. for adapters that name sessions
    /// themselves and never want auto-titling.
    pub async fn set_titled(&self, titled: bool) {
        self.state.lock().await.titled = titled;
    }

    /// Pre-load transcript history without submitting, persisting each
    /// message.  Used by tests and by callers that import prior turns.
    /// A non-empty preload counts as a resume for auto-titling purposes.
    pub async fn seed_transcript(&self, messages: Vec<TranscriptMessage>) {
        let mut st = self.state.lock().await;
        for m in &messages {
            self.persist_message(m);
        }
        if !messages.is_empty() {
            st.titled = true;
        }
        st.messages.extend(messages);
    }

    /// Drive one user turn to completion.
    ///
    /// Appends the user message, then loops provider call → tool dispatch
    /// until the model ends the turn, an error is terminal, the turn is
    /// cancelled, or the iteration bound is hit.  Events arrive on `tx` in
    /// total order; `TurnDone` is the final event of a successful turn.
    pub async fn submit(
        &self,
        user_text: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        {
            let mut st = self.state.lock().await;
            if st.running {
                let _ = tx
                    .send(AgentEvent::Error("agent is already running".into()))
                    .await;
                return Ok(());
            }
            st.running = true;
            st.cancelled = false;
            if repair_transcript(&mut st.messages) {
                debug!("repaired dangling tool calls before submit");
            }
            let user = TranscriptMessage::user(user_text);
            self.persist_message(&user);
            st.messages.push(user);
        }

        let result = self.run_loop(&tx).await;
        self.state.lock().await.running = false;
        result
    }

    async fn run_loop(&self, tx: &mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        for _iteration in 1..=MAX_ITERATIONS {
            if self.is_cancelled().await {
                return Ok(());
            }

            let req = self.build_request().await;
            let outcome = match self.stream_with_retry(req, tx).await {
                Ok(o) => o,
                Err(StreamCallError::Cancelled) => return Ok(()),
                Err(StreamCallError::Provider(e)) => {
                    // The transcript faithfully records the failure.
                    let msg = TranscriptMessage::assistant(format!("Error: {e}"));
                    self.push_and_persist(msg).await;
                    let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                    return Ok(());
                }
            };

            let StreamOutcome {
                mut blocks,
                stop_reason,
                usage,
            } = outcome;

            if stop_reason == StopReason::MaxTokens {
                blocks.push(ContentBlock::text(
                    "\n[response truncated: output token limit reached]",
                ));
            }
            if !blocks.is_empty() {
                self.push_and_persist(TranscriptMessage::with_blocks(Role::Assistant, blocks.clone()))
                    .await;
            }
            self.record_usage(&usage).await;
            let _ = tx
                .send(AgentEvent::StreamDone {
                    stop_reason: stop_reason.clone(),
                    usage,
                })
                .await;

            match stop_reason {
                StopReason::ToolUse => {
                    let uses: Vec<(String, String, Map<String, Value>)> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, name, input } => {
                                Some((id.clone(), name.clone(), input.clone()))
                            }
                            _ => None,
                        })
                        .collect();
                    if uses.is_empty() {
                        // A tool_use stop with no dispatchable calls (all
                        // dropped as malformed) would loop forever; end the
                        // turn instead.
                        let _ = tx.send(AgentEvent::TurnDone).await;
                        return Ok(());
                    }
                    let (results, cancelled) = self.dispatch_tools(&uses, tx).await;
                    self.push_and_persist(TranscriptMessage::with_blocks(Role::User, results))
                        .await;
                    if cancelled {
                        return Ok(());
                    }
                }
                StopReason::EndTurn | StopReason::MaxTokens => {
                    self.finish_turn(tx).await;
                    let _ = tx.send(AgentEvent::TurnDone).await;
                    return Ok(());
                }
                StopReason::Other(other) => {
                    let msg = format!("Error: unexpected stop reason: {other}");
                    self.push_and_persist(TranscriptMessage::assistant(msg.clone())).await;
                    let _ = tx.send(AgentEvent::Error(msg)).await;
                    return Ok(());
                }
            }
        }

        let msg = "loop limit exceeded";
        self.push_and_persist(TranscriptMessage::assistant(format!("Error: {msg}")))
            .await;
        let _ = tx.send(AgentEvent::Error(msg.into())).await;
        Ok(())
    }

    // ── Provider call with retry ─────────────────────────────────────────────

    async fn stream_with_retry(
        &self,
        req: StreamRequest,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<StreamOutcome, StreamCallError> {
        let mut schedule = RetrySchedule::new();
        loop {
            let err = match self.stream_once(req.clone(), tx).await {
                Ok(outcome) => return Ok(outcome),
                Err(StreamCallError::Cancelled) => return Err(StreamCallError::Cancelled),
                Err(StreamCallError::Provider(e)) => e,
            };
            if !is_retryable(&err) {
                return Err(StreamCallError::Provider(err));
            }
            let Some(attempt) = schedule.next_attempt() else {
                return Err(StreamCallError::Provider(err));
            };
            // A server hint overrides the computed wait, uncapped — the
            // server knows when it is ready.
            let wait = err.retry_after().unwrap_or(attempt.wait);
            let _ = tx
                .send(AgentEvent::Retrying {
                    attempt: attempt.attempt,
                    wait,
                    message: retry_message(&err),
                })
                .await;
            if is_transport_error(&err) {
                // Pooled connections may reuse the failing path; force fresh
                // sockets for the retry.
                http::refresh_pool();
            }
            if self.sleep_with_cancel(wait).await {
                return Err(StreamCallError::Cancelled);
            }
        }
    }

    /// One provider call: open the stream, forward text deltas, accumulate
    /// blocks, salvage on transport failure.
    async fn stream_once(
        &self,
        req: StreamRequest,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<StreamOutcome, StreamCallError> {
        let mut stream = self
            .provider
            .stream(req)
            .await
            .map_err(StreamCallError::Provider)?;
        let mut acc = StreamAccumulator::new();
        loop {
            if self.is_cancelled().await {
                return Err(StreamCallError::Cancelled);
            }
            let Some(item) = stream.next().await else {
                break;
            };
            match item {
                Ok(ev) => {
                    if let otto_model::StreamEvent::TextDelta(t) = &ev {
                        let _ = tx.send(AgentEvent::Delta(t.clone())).await;
                    }
                    if acc.push(ev) {
                        break;
                    }
                }
                Err(e) => match acc.salvage(e) {
                    Salvage::Complete => break,
                    Salvage::Restart(e) => return Err(StreamCallError::Provider(e)),
                },
            }
        }
        Ok(acc.finish())
    }

    /// Interruptible sleep; polls the cancelled flag every 100 ms.
    /// Returns `true` when cancelled.
    async fn sleep_with_cancel(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.is_cancelled().await {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
        }
    }

    // ── Tool dispatch ────────────────────────────────────────────────────────

    /// Execute one batch of tool calls.
    ///
    /// Parallel tools run concurrently and complete first; sequential tools
    /// then run one at a time in source order, with the `ask_user` channel
    /// serviced while they wait.  The returned `tool_result` blocks are in
    /// the same order as the calls — a wire-level invariant.
    async fn dispatch_tools(
        &self,
        uses: &[(String, String, Map<String, Value>)],
        tx: &mpsc::Sender<AgentEvent>,
    ) -> (Vec<ContentBlock>, bool) {
        let (disabled, plan_mode) = {
            let st = self.state.lock().await;
            (st.disabled_tools.clone(), st.plan_mode)
        };
        let cx = ToolContext {
            cwd: self.opts.cwd.clone(),
        };
        let n = uses.len();
        let mut outputs: Vec<Option<otto_tools::ToolOutput>> = (0..n).map(|_| None).collect();
        let mut cancelled = false;

        for (id, name, _) in uses {
            let _ = tx
                .send(AgentEvent::ToolStart {
                    id: id.clone(),
                    name: name.clone(),
                })
                .await;
        }

        // Masked and unknown calls answer immediately; the model reads the
        // message and recovers.
        for (i, (_, name, _)) in uses.iter().enumerate() {
            if !self.tools.is_available(name, &disabled, plan_mode) {
                outputs[i] = Some(otto_tools::ToolOutput::err(format!("Unknown tool: {name}")));
            }
        }

        // Parallel set first: they may not overlap with sequential tools,
        // whose contract is exclusivity.
        let mut handles = Vec::new();
        for (i, (id, name, input)) in uses.iter().enumerate() {
            if outputs[i].is_some() || self.tools.kind(name) != ToolKind::Parallel {
                continue;
            }
            let registry = Arc::clone(&self.tools);
            let call = ToolCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            };
            let cx = cx.clone();
            handles.push((
                i,
                tokio::spawn(async move { registry.execute(&call, &cx).await }),
            ));
        }
        for (i, handle) in handles {
            outputs[i] = Some(match handle.await {
                Ok(out) => out,
                Err(e) => otto_tools::ToolOutput::err(format!("tool panicked: {e}")),
            });
        }

        // Sequential set, one at a time in source order.
        let mut ask_rx = self.ask_rx.lock().await;
        for (i, (id, name, input)) in uses.iter().enumerate() {
            if outputs[i].is_some() {
                continue;
            }
            if cancelled {
                outputs[i] = Some(otto_tools::ToolOutput::err("cancelled"));
                continue;
            }
            let call = ToolCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            };
            let (out, c) = self.run_sequential(&call, &cx, &mut ask_rx, tx).await;
            outputs[i] = Some(out);
            cancelled |= c;
        }
        drop(ask_rx);

        // After a cancellation, no further events — the adapter already
        // stopped listening, and the results only exist to keep the
        // transcript paired.
        if !cancelled {
            for (i, (id, name, _)) in uses.iter().enumerate() {
                let out = outputs[i].as_ref().expect("every slot filled");
                let _ = tx
                    .send(AgentEvent::ToolDone {
                        id: id.clone(),
                        name: name.clone(),
                        output: out.content.clone(),
                        is_error: out.is_error,
                    })
                    .await;
            }
        }

        let blocks = uses
            .iter()
            .zip(outputs)
            .map(|((id, name, _), out)| {
                let out = out.expect("every slot filled");
                ContentBlock::tool_result(id.as_str(), name.as_str(), out.content, out.is_error)
            })
            .collect();
        (blocks, cancelled)
    }

    /// Run one sequential tool, servicing `ask_user` questions and polling
    /// cancellation while it executes.  Dropping the execution future on
    /// cancel also drops the question's reply receiver, which the tool
    /// reports as "cancelled".
    async fn run_sequential(
        &self,
        call: &ToolCall,
        cx: &ToolContext,
        ask_rx: &mut mpsc::Receiver<AskUserRequest>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> (otto_tools::ToolOutput, bool) {
        let mut fut = Box::pin(self.tools.execute(call, cx));
        let mut tick = tokio::time::interval(CANCEL_POLL);
        loop {
            tokio::select! {
                out = &mut fut => {
                    // A cancelled ask_user resolves through this branch too
                    // (its reply sender was dropped); the flag decides
                    // whether further events may be emitted.
                    let cancelled = self.is_cancelled().await;
                    return (out, cancelled);
                }
                Some(req) = ask_rx.recv() => {
                    let _ = tx
                        .send(AgentEvent::AskUser {
                            prompt: req.prompt,
                            reply: req.reply,
                        })
                        .await;
                }
                _ = tick.tick() => {
                    if self.is_cancelled().await {
                        return (otto_tools::ToolOutput::err("cancelled"), true);
                    }
                }
            }
        }
    }

    // ── End-of-turn bookkeeping ──────────────────────────────────────────────

    /// Opportunistic work after a successful turn: auto-title, auto-tags,
    /// then compaction if the watermark is over the threshold.
    async fn finish_turn(&self, tx: &mpsc::Sender<AgentEvent>) {
        let needs_title = !self.state.lock().await.titled;
        if needs_title {
            self.generate_title_and_tags(tx).await;
        }
        self.maybe_compact(tx).await;
    }

    async fn generate_title_and_tags(&self, tx: &mpsc::Sender<AgentEvent>) {
        let exchange = {
            let st = self.state.lock().await;
            let user = st
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let assistant = st
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            format!("User: {user}\n\nAssistant: {assistant}")
        };
        // One attempt per session, success or not — retrying a failing cheap
        // model every turn would cost more than the title is worth.
        self.state.lock().await.titled = true;

        let model = task_model(
            self.opts.task_models.title.as_deref(),
            self.provider.name(),
            &self.opts.model,
        );
        match run_text_task(
            self.provider.as_ref(),
            &model,
            TITLE_PROMPT,
            exchange.clone(),
            256,
        )
        .await
        {
            Ok(raw) => {
                let title = clean_title(&raw);
                if !title.is_empty() {
                    if let Err(e) = self.store.update_session_title(&self.session_id, &title) {
                        warn!(error = %e, "failed to persist session title");
                    }
                    let _ = tx.send(AgentEvent::Titled(title)).await;
                }
            }
            Err(e) => warn!(error = %e, "title generation failed"),
        }

        let tags_model = task_model(
            self.opts.task_models.tags.as_deref(),
            self.provider.name(),
            &self.opts.model,
        );
        match run_text_task(
            self.provider.as_ref(),
            &tags_model,
            TAGS_PROMPT,
            exchange,
            128,
        )
        .await
        {
            Ok(raw) => {
                let tags = parse_tags(&raw);
                if !tags.is_empty() {
                    if let Err(e) = self.store.update_session_tags(&self.session_id, &tags) {
                        warn!(error = %e, "failed to persist session tags");
                    }
                }
            }
            Err(e) => warn!(error = %e, "tag generation failed"),
        }
    }

    /// Client-side compaction.  The transcript is restructured under the
    /// lock; the summarization call runs outside it, and the placeholder is
    /// upgraded to the real summary afterwards.  On summary failure the
    /// placeholder stays — compaction never blocks the session.
    async fn maybe_compact(&self, tx: &mpsc::Sender<AgentEvent>) {
        let (plan, placeholder) = {
            let mut st = self.state.lock().await;
            if st.last_input_tokens <= COMPACTION_TOKEN_THRESHOLD {
                return;
            }
            let Some(plan) = plan_compaction(&st.messages) else {
                return;
            };
            let placeholder = apply_compaction(&mut st.messages, &plan);
            st.last_input_tokens = 0;
            (plan, placeholder)
        };

        let summary_text = self.summarize_dropped(&plan).await.unwrap_or_else(|e| {
            warn!(error = %e, "compaction summary failed; keeping placeholder");
            placeholder
        });

        {
            let mut st = self.state.lock().await;
            let idx = plan.placeholder_index();
            if let Some(m) = st.messages.get_mut(idx) {
                *m = TranscriptMessage::user(summary_text.clone());
            }
        }

        let cutoff = self
            .store
            .message_max_sequence(&self.session_id)
            .unwrap_or(0)
            .saturating_sub(COMPACTION_KEEP_TAIL as u64);
        if let Err(e) = self
            .store
            .save_compaction(&self.session_id, &summary_text, cutoff)
        {
            warn!(error = %e, "failed to persist compaction record");
        }
        let _ = tx
            .send(AgentEvent::Compacted {
                dropped: plan.dropped.len(),
            })
            .await;
    }

    async fn summarize_dropped(&self, plan: &CompactionPlan) -> anyhow::Result<String> {
        let model = task_model(
            self.opts.task_models.compact.as_deref(),
            self.provider.name(),
            &self.opts.model,
        );
        let rendered = serialize_dropped(&plan.dropped);
        let summary = run_text_task(
            self.provider.as_ref(),
            &model,
            SUMMARY_PROMPT,
            rendered,
            2048,
        )
        .await?;
        if summary.is_empty() {
            anyhow::bail!("summary model returned empty text");
        }
        Ok(format!("[Conversation summary]\n\n{summary}"))
    }

    // ── Small helpers ────────────────────────────────────────────────────────

    async fn build_request(&self) -> StreamRequest {
        let st = self.state.lock().await;
        let tools: Vec<ToolSpec> = self
            .tools
            .schemas(&st.disabled_tools, st.plan_mode)
            .into_iter()
            .map(|s| ToolSpec {
                name: s.name,
                description: s.description,
                input_schema: s.parameters,
            })
            .collect();
        StreamRequest {
            model: self.opts.model.clone(),
            system: self.opts.system_prompt.clone(),
            messages: st.messages.clone(),
            tools,
            max_tokens: self.opts.max_tokens,
        }
    }

    async fn is_cancelled(&self) -> bool {
        self.state.lock().await.cancelled
    }

    async fn push_and_persist(&self, message: TranscriptMessage) {
        self.persist_message(&message);
        self.state.lock().await.messages.push(message);
    }

    /// Store failures never abort the turn; the in-memory transcript stays
    /// authoritative and is reconciled on the next successful write.
    fn persist_message(&self, m: &TranscriptMessage) {
        let result = if m.blocks.is_empty() {
            self.store
                .append_message(&self.session_id, m.role, &m.content, m.approx_tokens())
        } else {
            self.store
                .append_message_blocks(&self.session_id, m.role, &m.blocks, m.approx_tokens())
        };
        if let Err(e) = result {
            warn!(error = %e, session = %self.session_id, "failed to persist message");
        }
    }

    async fn record_usage(&self, usage: &Usage) {
        {
            let mut st = self.state.lock().await;
            st.last_input_tokens = usage.input_tokens
                + usage.cache_read_input_tokens
                + usage.cache_creation_input_tokens;
        }
        if let Err(e) =
            self.store
                .update_session_tokens(&self.session_id, usage.input_tokens, usage.output_tokens)
        {
            warn!(error = %e, "failed to persist token usage");
        }
    }
}
