// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::schema::Config;

/// Load configuration.
///
/// Search order: explicit `path` argument, `$OTTO_CONFIG`, then
/// `<config-dir>/otto/config.yaml`.  A missing file yields the defaults; a
/// present-but-invalid file is an error (silently ignoring a typo'd config
/// is worse than failing).
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let candidate: Option<PathBuf> = path
        .map(|p| p.to_path_buf())
        .or_else(|| std::env::var("OTTO_CONFIG").ok().map(PathBuf::from))
        .or_else(default_config_path);

    match candidate {
        Some(p) if p.exists() => {
            let raw = std::fs::read_to_string(&p)
                .with_context(|| format!("reading config {}", p.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", p.display()))
        }
        _ => Ok(Config::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("otto").join("config.yaml"))
}

/// Default state directory for the session store.
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("otto")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
