// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use otto_model::ProviderError;

/// Maximum retry attempts per provider call (the initial call is free).
pub const MAX_ATTEMPTS: u32 = 5;

const BASE_WAIT: Duration = Duration::from_secs(2);
const WAIT_CAP: Duration = Duration::from_secs(30);

/// One granted retry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt: u32,
    /// Exponential wait; a server hint overrides this, uncapped.
    pub wait: Duration,
}

/// Exponential backoff budget: 2 s base, doubling, capped at 30 s.
#[derive(Debug)]
pub struct RetrySchedule {
    attempt: u32,
    wait: Duration,
}

impl RetrySchedule {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            wait: BASE_WAIT,
        }
    }

    /// Grant the next retry slot, or `None` when the budget is exhausted.
    pub fn next_attempt(&mut self) -> Option<RetryAttempt> {
        if self.attempt >= MAX_ATTEMPTS {
            return None;
        }
        self.attempt += 1;
        let granted = RetryAttempt {
            attempt: self.attempt,
            wait: self.wait,
        };
        self.wait = (self.wait * 2).min(WAIT_CAP);
        Some(granted)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the error is worth another attempt.
///
/// Retryable: rate limits and overload (by status or by body kind), and
/// transient transport failures.  Auth errors, invalid requests, and unknown
/// models are fatal.
pub fn is_retryable(err: &ProviderError) -> bool {
    match err {
        ProviderError::Api { status, kind, .. } => {
            matches!(status, 429 | 503 | 529)
                || matches!(kind.as_str(), "rate_limit_error" | "overloaded_error")
        }
        ProviderError::Stream(_) => is_transient_transport(&err.to_string()),
        ProviderError::Http(e) => e.is_connect() || e.is_timeout(),
        ProviderError::Config(_) => false,
    }
}

fn is_transient_transport(rendered: &str) -> bool {
    let m = rendered.to_lowercase();
    m.contains("unexpected eof")
        || m.contains("connection reset")
        || m.contains("broken pipe")
        || m.contains("chunk")
        || m.contains("reading stream")
}

/// Whether the failure was at the transport layer, in which case idle pooled
/// connections are flushed before the retry.
pub fn is_transport_error(err: &ProviderError) -> bool {
    matches!(err, ProviderError::Stream(_) | ProviderError::Http(_))
}

/// Human-readable cause for the `Retrying` event.
pub fn retry_message(err: &ProviderError) -> String {
    match err {
        ProviderError::Api { status, kind, .. } => {
            if *status == 429 || kind == "rate_limit_error" {
                "rate limited by provider".into()
            } else if *status == 529 || kind == "overloaded_error" {
                "provider overloaded".into()
            } else {
                "provider unavailable".into()
            }
        }
        _ => "connection lost".into(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
