// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "otto", about = "A multi-session AI coding agent runtime", version)]
pub struct Cli {
    /// Path to the config file (default: <config-dir>/otto/config.yaml).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG controls the filter).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit one prompt and stream the reply.
    Run {
        /// The user prompt.
        prompt: String,
        /// Model override as "provider/model".
        #[arg(long, short = 'm')]
        model: Option<String>,
        /// Resume an existing session by id.
        #[arg(long, short = 's')]
        session: Option<String>,
        /// Plan mode: write-capable tools are rejected.
        #[arg(long)]
        plan: bool,
    },

    /// List stored sessions.
    Sessions {
        /// Show at most this many.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Fork a session at a message sequence into a new session.
    Branch {
        /// Source session id.
        session: String,
        /// Copy messages up to and including this sequence.
        at_seq: u64,
    },

    /// Delete a session and its messages.
    Delete {
        /// Session id.
        session: String,
    },

    /// List models available from the configured provider.
    Models,

    /// Print the effective configuration.
    ShowConfig,
}
