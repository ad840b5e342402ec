// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the agent loop.
///
/// Uses `ScriptedProvider` so every scenario is deterministic and requires
/// no network access.
#[cfg(test)]
mod agent_tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use otto_model::{
        ContentBlock, MockEvent, Role, ScriptedCall, ScriptedProvider, StopReason, StreamEvent,
        TranscriptMessage, Usage,
    };
    use otto_store::{MemoryStore, Store};
    use otto_tools::{AskUserTool, ListFilesTool, ToolRegistry, WriteFileTool};

    use crate::{AgentEvent, AgentOptions, AgentService, MAX_ITERATIONS};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn tool_use_script(id: &str, name: &str, args: &str) -> ScriptedCall {
        ScriptedCall::Events(vec![
            MockEvent::Event(StreamEvent::ToolCall {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args.into(),
            }),
            MockEvent::Event(StreamEvent::Usage(Usage {
                input_tokens: 100,
                output_tokens: 20,
                ..Usage::default()
            })),
            MockEvent::Event(StreamEvent::Stop(StopReason::ToolUse)),
            MockEvent::Event(StreamEvent::Done),
        ])
    }

    fn text_script(reply: &str) -> ScriptedCall {
        ScriptedCall::Events(vec![
            MockEvent::Event(StreamEvent::TextDelta(reply.into())),
            MockEvent::Event(StreamEvent::Usage(Usage {
                input_tokens: 100,
                output_tokens: 50,
                ..Usage::default()
            })),
            MockEvent::Event(StreamEvent::Stop(StopReason::EndTurn)),
            MockEvent::Event(StreamEvent::Done),
        ])
    }

    struct Harness {
        service: Arc<AgentService>,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(provider: ScriptedProvider, registry: ToolRegistry) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut registry = registry;
        let (ask_tool, ask_rx) = AskUserTool::channel();
        registry.register(ask_tool);
        let opts = AgentOptions {
            model: "test-model".into(),
            cwd: dir.path().to_path_buf(),
            ..AgentOptions::default()
        };
        let service = AgentService::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(provider),
            Arc::new(registry),
            ask_rx,
            opts,
        )
        .unwrap();
        Harness {
            service: Arc::new(service),
            store,
            _dir: dir,
        }
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        harness_with(provider, ToolRegistry::new())
    }

    /// Drain the channel until the terminal event (TurnDone or Error).
    async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, AgentEvent::TurnDone | AgentEvent::Error(_));
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    async fn run_turn(h: &Harness, text: &str) -> Vec<AgentEvent> {
        // Mark titled so background title/tag calls do not consume scripts.
        h.service.set_titled(true).await;
        let (tx, rx) = mpsc::channel(4096);
        h.service.submit(text, tx).await.unwrap();
        collect_events(rx).await
    }

    fn assert_alternating(messages: &[TranscriptMessage]) {
        for pair in messages.windows(2) {
            assert_ne!(
                pair[0].role, pair[1].role,
                "two consecutive {:?} messages",
                pair[0].role
            );
        }
    }

    // ── S1: simple text turn ──────────────────────────────────────────────────

    #[tokio::test]
    async fn simple_text_turn_emits_delta_streamdone_turndone() {
        let h = harness(ScriptedProvider::always_text("Hi."));
        let events = run_turn(&h, "Hello").await;

        assert!(
            events
                .iter()
                .any(|e| matches!(e, AgentEvent::Delta(t) if t == "Hi.")),
            "expected at least one Delta"
        );
        let stream_done = events.iter().find_map(|e| match e {
            AgentEvent::StreamDone { stop_reason, usage } => Some((stop_reason.clone(), *usage)),
            _ => None,
        });
        let (stop, usage) = stream_done.expect("StreamDone missing");
        assert_eq!(stop, StopReason::EndTurn);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
    }

    #[tokio::test]
    async fn simple_text_turn_persists_user_and_assistant() {
        let h = harness(ScriptedProvider::always_text("Hi."));
        let _ = run_turn(&h, "Hello").await;

        let msgs = h.store.get_messages(h.service.session_id()).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].content, "Hello");
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].content, "Hi.");
    }

    // ── S2: one tool call then end ────────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_round_trip_runs_exactly_two_provider_calls() {
        let provider = ScriptedProvider::tool_then_text(
            "u1",
            "list_files",
            r#"{"path":"."}"#,
            "Here are the files.",
        );
        let calls = Arc::clone(&provider.calls);
        let last_request = Arc::clone(&provider.last_request);

        let mut reg = ToolRegistry::new();
        reg.register(ListFilesTool);
        let h = harness_with(provider, reg);
        std::fs::write(h._dir.path().join("a.txt"), "x").unwrap();

        let events = run_turn(&h, "List files.").await;

        let starts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolStart { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        let dones: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolDone { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["list_files"]);
        assert_eq!(dones, vec!["list_files"]);
        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
        assert_eq!(*calls.lock().unwrap(), 2, "exactly two provider calls");

        // The second request's transcript pairs the tool_use with its result
        // and still alternates roles.
        let req = last_request.lock().unwrap().clone().unwrap();
        assert_alternating(&req.messages);
        let tool_msg = req
            .messages
            .iter()
            .find(|m| m.has_tool_result())
            .expect("tool_result message missing");
        assert_eq!(tool_msg.role, Role::User);
        assert_eq!(tool_msg.tool_result_ids(), vec!["u1"]);
        match &tool_msg.blocks[0] {
            ContentBlock::ToolResult {
                result, is_error, ..
            } => {
                assert!(!is_error);
                assert!(result.contains("a.txt"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_result_order_matches_tool_use_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedCall::Events(vec![
                MockEvent::Event(StreamEvent::ToolCall {
                    index: 0,
                    id: "first".into(),
                    name: "list_files".into(),
                    arguments: "{}".into(),
                }),
                MockEvent::Event(StreamEvent::ToolCall {
                    index: 1,
                    id: "second".into(),
                    name: "nonexistent_tool".into(),
                    arguments: "{}".into(),
                }),
                MockEvent::Event(StreamEvent::Stop(StopReason::ToolUse)),
                MockEvent::Event(StreamEvent::Done),
            ]),
            text_script("done"),
        ]);
        let mut reg = ToolRegistry::new();
        reg.register(ListFilesTool);
        let h = harness_with(provider, reg);

        let _ = run_turn(&h, "go").await;

        let transcript = h.service.transcript().await;
        let results = transcript
            .iter()
            .find(|m| m.has_tool_result())
            .expect("results missing");
        assert_eq!(results.tool_result_ids(), vec!["first", "second"]);
        match &results.blocks[1] {
            ContentBlock::ToolResult {
                result, is_error, ..
            } => {
                assert!(is_error);
                assert_eq!(result, "Unknown tool: nonexistent_tool");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    // ── S3: rate-limit then success ───────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn rate_limit_honors_server_hint_then_succeeds() {
        let provider = ScriptedProvider::rate_limited_then_text(
            1,
            Some(Duration::from_millis(100)),
            "recovered",
        );
        let h = harness(provider);
        let events = run_turn(&h, "go").await;

        let retries: Vec<(u32, Duration)> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Retrying { attempt, wait, .. } => Some((*attempt, *wait)),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(1, Duration::from_millis(100))]);
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Error(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Delta(t) if t == "recovered")));
        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
    }

    // ── S4: non-retryable error persisted ─────────────────────────────────────

    #[tokio::test]
    async fn invalid_request_is_fatal_and_persisted() {
        let provider = ScriptedProvider::new(vec![ScriptedCall::Fail {
            status: 400,
            kind: "invalid_request_error".into(),
            message: "unknown model".into(),
            retry_after: None,
        }]);
        let h = harness(provider);
        let events = run_turn(&h, "go").await;

        assert!(
            !events.iter().any(|e| matches!(e, AgentEvent::Retrying { .. })),
            "a 400 must not be retried"
        );
        let err = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::Error(m) => Some(m.clone()),
                _ => None,
            })
            .expect("Error event missing");
        assert!(err.contains("invalid_request_error"));

        let msgs = h.store.get_messages(h.service.session_id()).unwrap();
        let last = msgs.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.content.starts_with("Error:"));
        assert!(last.content.contains("invalid_request_error"));
    }

    // ── S5: ask_user round trip ───────────────────────────────────────────────

    #[tokio::test]
    async fn ask_user_round_trip_feeds_answer_back_to_model() {
        let provider = ScriptedProvider::new(vec![
            tool_use_script("a1", "ask_user", r#"{"question":"What is the target?"}"#),
            text_script("Deploying to production."),
        ]);
        let last_request = Arc::clone(&provider.last_request);
        let h = harness(provider);
        h.service.set_titled(true).await;

        let svc = Arc::clone(&h.service);
        let (tx, mut rx) = mpsc::channel(256);
        let turn = tokio::spawn(async move { svc.submit("deploy", tx).await });

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let AgentEvent::AskUser { prompt, reply } = &ev {
                assert_eq!(prompt, "What is the target?");
                reply.send("production".to_string()).await.unwrap();
            }
            let done = matches!(ev, AgentEvent::TurnDone | AgentEvent::Error(_));
            events.push(ev);
            if done {
                break;
            }
        }
        turn.await.unwrap().unwrap();

        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
        let req = last_request.lock().unwrap().clone().unwrap();
        let answered = req.messages.iter().any(|m| {
            m.blocks.iter().any(|b| {
                matches!(b, ContentBlock::ToolResult { result, is_error, .. }
                    if result == "production" && !is_error)
            })
        });
        assert!(answered, "answer must appear as the tool_result");
    }

    // ── S6: compaction ────────────────────────────────────────────────────────

    fn alternating(n: usize) -> Vec<TranscriptMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    TranscriptMessage::user(format!("user {i}"))
                } else {
                    TranscriptMessage::assistant(format!("assistant {i}"))
                }
            })
            .collect()
    }

    fn text_script_with_input_tokens(reply: &str, input_tokens: u64) -> ScriptedCall {
        ScriptedCall::Events(vec![
            MockEvent::Event(StreamEvent::TextDelta(reply.into())),
            MockEvent::Event(StreamEvent::Usage(Usage {
                input_tokens,
                output_tokens: 10,
                ..Usage::default()
            })),
            MockEvent::Event(StreamEvent::Stop(StopReason::EndTurn)),
            MockEvent::Event(StreamEvent::Done),
        ])
    }

    #[tokio::test]
    async fn oversize_turn_triggers_compaction_and_resets_watermark() {
        let provider = ScriptedProvider::new(vec![
            text_script_with_input_tokens("working on it", 150_000),
            text_script("the summary body"),
        ]);
        let h = harness(provider);
        h.service.seed_transcript(alternating(32)).await;

        let events = run_turn(&h, "next task").await;

        let compacted: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Compacted { dropped } => Some(*dropped),
                _ => None,
            })
            .collect();
        assert_eq!(compacted.len(), 1, "exactly one Compacted event");

        let transcript = h.service.transcript().await;
        assert!(transcript.len() < 32, "transcript must shrink");
        assert_eq!(transcript[0].content, "user 0", "head preserved verbatim");
        assert!(
            transcript
                .iter()
                .any(|m| m.content.contains("[Conversation summary]")),
            "summary message missing"
        );
        assert!(
            transcript
                .iter()
                .any(|m| m.content.contains("the summary body")),
            "summary text missing"
        );
        assert_alternating(&transcript);
        assert_eq!(h.service.last_input_tokens().await, 0, "watermark reset");

        let record = h
            .store
            .latest_compaction(h.service.session_id())
            .unwrap()
            .expect("compaction record persisted");
        assert!(record.summary_text.contains("[Conversation summary]"));
    }

    #[tokio::test]
    async fn small_turn_never_compacts() {
        let h = harness(ScriptedProvider::always_text("ok"));
        h.service.seed_transcript(alternating(32)).await;
        let events = run_turn(&h, "go").await;
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Compacted { .. })));
        assert_eq!(h.service.transcript().await.len(), 34);
    }

    #[tokio::test]
    async fn failed_summary_keeps_placeholder() {
        let provider = ScriptedProvider::new(vec![
            text_script_with_input_tokens("big turn", 150_000),
            ScriptedCall::Fail {
                status: 400,
                kind: "invalid_request_error".into(),
                message: "nope".into(),
                retry_after: None,
            },
        ]);
        let h = harness(provider);
        h.service.seed_transcript(alternating(32)).await;
        let events = run_turn(&h, "next").await;

        assert!(events.iter().any(|e| matches!(e, AgentEvent::Compacted { .. })));
        let transcript = h.service.transcript().await;
        assert!(
            transcript
                .iter()
                .any(|m| m.content.contains("earlier messages compacted to save context")),
            "placeholder must survive a failed summary"
        );
    }

    // ── Loop bound ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn endless_tool_use_stops_at_loop_limit() {
        let scripts: Vec<ScriptedCall> = (0..=MAX_ITERATIONS + 2)
            .map(|i| tool_use_script(&format!("u{i}"), "phantom_tool", "{}"))
            .collect();
        let provider = ScriptedProvider::new(scripts);
        let calls = Arc::clone(&provider.calls);
        let h = harness(provider);

        let events = run_turn(&h, "go").await;

        assert_eq!(*calls.lock().unwrap(), MAX_ITERATIONS);
        match events.last() {
            Some(AgentEvent::Error(m)) => assert_eq!(m, "loop limit exceeded"),
            other => panic!("expected terminal Error, got {other:?}"),
        }
        let msgs = h.store.get_messages(h.service.session_id()).unwrap();
        assert_eq!(msgs.last().unwrap().content, "Error: loop limit exceeded");
    }

    // ── Retry bound ───────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_exhausts_exactly_five_retries() {
        let scripts: Vec<ScriptedCall> = (0..6)
            .map(|_| ScriptedCall::Fail {
                status: 429,
                kind: "rate_limit_error".into(),
                message: "slow down".into(),
                retry_after: None,
            })
            .collect();
        let provider = ScriptedProvider::new(scripts);
        let calls = Arc::clone(&provider.calls);
        let h = harness(provider);

        let events = run_turn(&h, "go").await;

        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Retrying { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
        assert!(matches!(events.last(), Some(AgentEvent::Error(_))));
        assert_eq!(*calls.lock().unwrap(), 6, "initial call plus five retries");
    }

    // ── Stream salvage ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn truncated_text_stream_is_salvaged_as_end_turn() {
        let provider = ScriptedProvider::new(vec![ScriptedCall::Events(vec![
            MockEvent::Event(StreamEvent::TextDelta("partial answ".into())),
            MockEvent::StreamError("unexpected EOF".into()),
        ])]);
        let h = harness(provider);
        let events = run_turn(&h, "go").await;

        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
        let done = events.iter().find_map(|e| match e {
            AgentEvent::StreamDone { stop_reason, .. } => Some(stop_reason.clone()),
            _ => None,
        });
        assert_eq!(done, Some(StopReason::EndTurn));
        let msgs = h.store.get_messages(h.service.session_id()).unwrap();
        assert_eq!(msgs.last().unwrap().content, "partial answ");
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_tool_call_stream_is_retried() {
        let provider = ScriptedProvider::new(vec![
            ScriptedCall::Events(vec![
                MockEvent::Event(StreamEvent::ToolCall {
                    index: 0,
                    id: "u1".into(),
                    name: "shell".into(),
                    arguments: r#"{"command":"rm"#.into(),
                }),
                MockEvent::StreamError("connection reset by peer".into()),
            ]),
            text_script("clean retry"),
        ]);
        let calls = Arc::clone(&provider.calls);
        let h = harness(provider);
        let events = run_turn(&h, "go").await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Retrying { message, .. } if message == "connection lost")));
        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    // ── max_tokens handling ───────────────────────────────────────────────────

    #[tokio::test]
    async fn max_tokens_ends_turn_with_warning_block() {
        let provider = ScriptedProvider::new(vec![ScriptedCall::Events(vec![
            MockEvent::Event(StreamEvent::TextDelta("half a thou".into())),
            MockEvent::Event(StreamEvent::Stop(StopReason::MaxTokens)),
            MockEvent::Event(StreamEvent::Done),
        ])]);
        let h = harness(provider);
        let events = run_turn(&h, "go").await;

        assert!(matches!(events.last(), Some(AgentEvent::TurnDone)));
        let msgs = h.store.get_messages(h.service.session_id()).unwrap();
        assert!(msgs.last().unwrap().content.contains("[response truncated"));
    }

    // ── Concurrency & cancellation ────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_submit_is_rejected() {
        let provider = ScriptedProvider::new(vec![
            tool_use_script("a1", "ask_user", r#"{"question":"hold"}"#),
            text_script("released"),
        ]);
        let h = harness(provider);
        h.service.set_titled(true).await;

        let svc = Arc::clone(&h.service);
        let (tx1, mut rx1) = mpsc::channel(256);
        let first = tokio::spawn(async move { svc.submit("one", tx1).await });

        // Wait until the first turn is suspended on the question.
        let ask = loop {
            match rx1.recv().await.expect("first turn died") {
                AgentEvent::AskUser { reply, .. } => break reply,
                _ => continue,
            }
        };

        let (tx2, mut rx2) = mpsc::channel(16);
        h.service.submit("two", tx2).await.unwrap();
        match rx2.recv().await {
            Some(AgentEvent::Error(m)) => assert_eq!(m, "agent is already running"),
            other => panic!("expected rejection, got {other:?}"),
        }

        ask.send("ok".to_string()).await.unwrap();
        while let Some(ev) = rx1.recv().await {
            if matches!(ev, AgentEvent::TurnDone | AgentEvent::Error(_)) {
                break;
            }
        }
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_during_ask_user_records_cancelled_result() {
        let provider = ScriptedProvider::new(vec![tool_use_script(
            "a1",
            "ask_user",
            r#"{"question":"still there?"}"#,
        )]);
        let h = harness(provider);
        h.service.set_titled(true).await;

        let svc = Arc::clone(&h.service);
        let (tx, mut rx) = mpsc::channel(256);
        let turn = tokio::spawn(async move { svc.submit("go", tx).await });

        let mut saw_ask = false;
        let mut after_ask = Vec::new();
        while let Some(ev) = rx.recv().await {
            if saw_ask {
                after_ask.push(ev);
                continue;
            }
            if matches!(ev, AgentEvent::AskUser { .. }) {
                saw_ask = true;
                h.service.cancel().await;
            }
        }
        turn.await.unwrap().unwrap();

        assert!(saw_ask);
        assert!(
            after_ask.is_empty(),
            "no events may follow cancellation: {after_ask:?}"
        );
        let transcript = h.service.transcript().await;
        let results = transcript
            .iter()
            .find(|m| m.has_tool_result())
            .expect("cancelled ask must still be answered in the transcript");
        match &results.blocks[0] {
            ContentBlock::ToolResult {
                result, is_error, ..
            } => {
                assert!(is_error);
                assert_eq!(result, "cancelled");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    // ── Disabled tools & plan mode ────────────────────────────────────────────

    #[tokio::test]
    async fn disabled_tool_is_treated_as_unknown() {
        let provider = ScriptedProvider::new(vec![
            tool_use_script("u1", "list_files", "{}"),
            text_script("ok"),
        ]);
        let last_request = Arc::clone(&provider.last_request);
        let mut reg = ToolRegistry::new();
        reg.register(ListFilesTool);
        let h = harness_with(provider, reg);
        h.service
            .set_disabled_tools(HashSet::from(["list_files".to_string()]))
            .await;

        let _ = run_turn(&h, "go").await;

        // Not advertised…
        let req = last_request.lock().unwrap().clone().unwrap();
        assert!(!req.tools.iter().any(|t| t.name == "list_files"));
        // …and answered as unknown when called anyway.
        let transcript = h.service.transcript().await;
        let results = transcript.iter().find(|m| m.has_tool_result()).unwrap();
        match &results.blocks[0] {
            ContentBlock::ToolResult { result, is_error, .. } => {
                assert!(is_error);
                assert_eq!(result, "Unknown tool: list_files");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn plan_mode_rejects_write_capable_tools() {
        let provider = ScriptedProvider::new(vec![
            tool_use_script("u1", "write_file", r#"{"path":"x","content":"y"}"#),
            text_script("ok"),
        ]);
        let last_request = Arc::clone(&provider.last_request);
        let mut reg = ToolRegistry::new();
        reg.register(WriteFileTool);
        reg.register(ListFilesTool);
        let h = harness_with(provider, reg);
        h.service.set_plan_mode(true).await;

        let _ = run_turn(&h, "go").await;

        let req = last_request.lock().unwrap().clone().unwrap();
        assert!(!req.tools.iter().any(|t| t.name == "write_file"));
        assert!(req.tools.iter().any(|t| t.name == "list_files"));
        let transcript = h.service.transcript().await;
        let results = transcript.iter().find(|m| m.has_tool_result()).unwrap();
        match &results.blocks[0] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    // ── Auto-title ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_turn_of_untitled_session_generates_title_and_tags() {
        let provider = ScriptedProvider::new(vec![
            text_script("Let me fix that parser."),
            text_script("Fix recursive descent parser"),
            text_script("rust, parser"),
        ]);
        let h = harness(provider);
        // Intentionally NOT marking titled.
        let (tx, rx) = mpsc::channel(256);
        h.service.submit("my parser is broken", tx).await.unwrap();
        let events = collect_events(rx).await;

        let titled = events.iter().find_map(|e| match e {
            AgentEvent::Titled(t) => Some(t.clone()),
            _ => None,
        });
        assert_eq!(titled.as_deref(), Some("Fix recursive descent parser"));
        let record = h
            .store
            .get_session(h.service.session_id())
            .unwrap()
            .unwrap();
        assert_eq!(record.title, "Fix recursive descent parser");
        assert_eq!(record.tags, vec!["rust", "parser"]);
        assert!(h.service.is_titled().await);
    }

    #[tokio::test]
    async fn second_turn_does_not_retitle() {
        let provider = ScriptedProvider::new(vec![
            text_script("first"),
            text_script("A title"),
            text_script("tag"),
            text_script("second"),
        ]);
        let calls = Arc::clone(&provider.calls);
        let h = harness(provider);
        let (tx, rx) = mpsc::channel(256);
        h.service.submit("one", tx).await.unwrap();
        let _ = collect_events(rx).await;
        let (tx, rx) = mpsc::channel(256);
        h.service.submit("two", tx).await.unwrap();
        let _ = collect_events(rx).await;
        // 1 chat + title + tags + 1 chat — no second title pass.
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    // ── Resume ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn resume_reloads_transcript_and_sets_titled() {
        let h = harness(ScriptedProvider::always_text("Hi."));
        let _ = run_turn(&h, "Hello").await;
        let sid = h.service.session_id().to_string();

        let (_ask, ask_rx) = AskUserTool::channel();
        let resumed = AgentService::resume(
            &sid,
            Arc::clone(&h.store) as Arc<dyn Store>,
            Arc::new(ScriptedProvider::always_text("again")),
            Arc::new(ToolRegistry::new()),
            ask_rx,
            AgentOptions::default(),
        )
        .unwrap();
        let transcript = resumed.transcript().await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].content, "Hello");
        assert!(resumed.is_titled().await);
    }

    #[tokio::test]
    async fn resume_after_compaction_prepends_summary_pair() {
        let store = Arc::new(MemoryStore::new());
        let record = store.create_session("/p", "mock/test").unwrap();
        for i in 0..30 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append_message(&record.id, role, &format!("m{i}"), 1)
                .unwrap();
        }
        store
            .save_compaction(&record.id, "[Conversation summary]\n\nolder work", 10)
            .unwrap();

        let (_ask, ask_rx) = AskUserTool::channel();
        let resumed = AgentService::resume(
            &record.id,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(ScriptedProvider::always_text("x")),
            Arc::new(ToolRegistry::new()),
            ask_rx,
            AgentOptions::default(),
        )
        .unwrap();
        let transcript = resumed.transcript().await;
        // summary pair + messages 11..=30
        assert_eq!(transcript.len(), 22);
        assert!(transcript[0].content.contains("[Conversation summary]"));
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(transcript[2].content, "m10");
        assert_alternating(&transcript);
    }

    #[tokio::test]
    async fn resume_repairs_dangling_tool_use() {
        let store = Arc::new(MemoryStore::new());
        let record = store.create_session("/p", "mock/test").unwrap();
        store
            .append_message(&record.id, Role::User, "run it", 1)
            .unwrap();
        store
            .append_message_blocks(
                &record.id,
                Role::Assistant,
                &[ContentBlock::tool_use("u9", "shell", serde_json::Map::new())],
                1,
            )
            .unwrap();

        let (_ask, ask_rx) = AskUserTool::channel();
        let resumed = AgentService::resume(
            &record.id,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(ScriptedProvider::always_text("x")),
            Arc::new(ToolRegistry::new()),
            ask_rx,
            AgentOptions::default(),
        )
        .unwrap();
        let transcript = resumed.transcript().await;
        assert_eq!(transcript.len(), 1, "dangling tool_use must be dropped");
        assert_eq!(transcript[0].content, "run it");
    }
}
