// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashSet;
use std::io::Write as _;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use otto_config::Config;
use otto_core::{AgentEvent, AgentOptions, AgentService, TaskModels, TaskTool};
use otto_model::Provider;
use otto_store::{JsonStore, Store};
use otto_tools::{
    AskUserTool, ListFilesTool, ReadFileTool, ShellTool, ToolRegistry, WriteFileTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let config = otto_config::load(cli.config.as_deref())?;
    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&otto_config::default_state_dir())?);

    match cli.command {
        Commands::Run {
            prompt,
            model,
            session,
            plan,
        } => run_turn(&config, store, prompt, model, session, plan).await,
        Commands::Sessions { limit } => {
            for s in store.list_sessions()?.into_iter().take(limit) {
                println!(
                    "{}  {:>7} msgs  {:>9} in / {:>8} out  {}",
                    s.id, s.message_count, s.input_tokens, s.output_tokens, s.title
                );
            }
            Ok(())
        }
        Commands::Branch { session, at_seq } => {
            let branch = store.branch_session(&session, at_seq)?;
            println!("{}", branch.id);
            Ok(())
        }
        Commands::Delete { session } => store.delete_session(&session),
        Commands::Models => {
            let provider = build_provider(&config, None)?.0;
            for id in provider.fetch_models().await? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

/// Build the provider plus the bare model id from config or an override.
fn build_provider(
    config: &Config,
    override_ref: Option<&str>,
) -> anyhow::Result<(Arc<dyn Provider>, String)> {
    let model_ref = override_ref.unwrap_or(&config.model);
    let (provider_id, model) = otto_model::split_model_ref(model_ref)?;
    let provider = otto_model::from_config(
        provider_id,
        config.api_key(provider_id),
        config.base_url(provider_id),
    )?;
    Ok((provider, model.to_string()))
}

fn bare_model(config: &Config, field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(|m| m.split_once('/').map(|(_, m)| m).unwrap_or(m).to_string())
}

async fn run_turn(
    config: &Config,
    store: Arc<dyn Store>,
    prompt: String,
    model_override: Option<String>,
    session: Option<String>,
    plan: bool,
) -> anyhow::Result<()> {
    let (provider, model) = build_provider(config, model_override.as_deref())?;

    let cwd = std::env::current_dir().context("cannot resolve working directory")?;
    let opts = AgentOptions {
        model,
        system_prompt: config
            .system_prompt
            .clone()
            .unwrap_or_else(|| default_system_prompt(&cwd)),
        cwd: cwd.clone(),
        max_tokens: config.max_tokens,
        task_models: TaskModels {
            compact: bare_model(config, &config.model_compact),
            title: bare_model(config, &config.model_title),
            tags: bare_model(config, &config.model_tags),
        },
        disabled_tools: config.disabled_tools.iter().cloned().collect::<HashSet<_>>(),
    };

    let mut registry = ToolRegistry::new();
    registry.register(ListFilesTool);
    registry.register(ReadFileTool);
    registry.register(WriteFileTool);
    registry.register(ShellTool::default());
    registry.register(TaskTool::new(
        Arc::clone(&provider),
        opts.clone(),
        Arc::new(AtomicUsize::new(0)),
    ));
    let (ask_tool, ask_rx) = AskUserTool::channel();
    registry.register(ask_tool);

    let service = match &session {
        Some(id) => AgentService::resume(
            id,
            Arc::clone(&store),
            provider,
            Arc::new(registry),
            ask_rx,
            opts,
        )?,
        None => AgentService::new(
            Arc::clone(&store),
            provider,
            Arc::new(registry),
            ask_rx,
            opts,
        )?,
    };
    service.set_plan_mode(plan).await;
    let service = Arc::new(service);
    eprintln!("session {}", service.session_id());

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let turn = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.submit(&prompt, tx).await })
    };

    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Delta(t) => {
                print!("{t}");
                std::io::stdout().flush().ok();
            }
            AgentEvent::StreamDone { usage, .. } => {
                eprintln!(
                    "\n[tokens: {} in / {} out, cache {} read / {} written]",
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.cache_read_input_tokens,
                    usage.cache_creation_input_tokens
                );
            }
            AgentEvent::ToolStart { name, .. } => eprintln!("[tool {name} ...]"),
            AgentEvent::ToolDone {
                name, is_error, ..
            } => eprintln!("[tool {name} {}]", if is_error { "failed" } else { "done" }),
            AgentEvent::AskUser { prompt, reply } => {
                eprint!("{prompt}\n> ");
                let answer = tokio::task::spawn_blocking(read_stdin_line).await??;
                let _ = reply.send(answer).await;
            }
            AgentEvent::Retrying {
                attempt,
                wait,
                message,
            } => eprintln!("[retrying ({message}), attempt {attempt}, waiting {wait:?}]"),
            AgentEvent::Compacted { dropped } => {
                eprintln!("[compacted {dropped} earlier messages]")
            }
            AgentEvent::Titled(title) => eprintln!("[session titled: {title}]"),
            AgentEvent::Error(e) => eprintln!("error: {e}"),
            AgentEvent::TurnDone => println!(),
        }
    }

    turn.await??;
    Ok(())
}

fn read_stdin_line() -> anyhow::Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading answer from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn default_system_prompt(cwd: &std::path::Path) -> String {
    format!(
        "You are otto, an AI coding agent working in {}. \
         Use the available tools to inspect and modify the project. \
         Ask the user with ask_user when a decision is theirs to make. \
         Be concise.",
        cwd.display()
    )
}
