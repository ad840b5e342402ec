// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-global HTTP client.
//!
//! All provider drivers share one connection pool.  `refresh_pool()` swaps in
//! a fresh client before a stream-error retry: pooled connections may reuse a
//! failing path, and retry-on-stale is only automatic for idempotent methods,
//! which these POSTs are not.

use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::RwLock;

static CLIENT: OnceLock<RwLock<reqwest::Client>> = OnceLock::new();

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        // The builder only fails on TLS backend misconfiguration, which is a
        // startup-time programming error.
        .unwrap_or_default()
}

fn slot() -> &'static RwLock<reqwest::Client> {
    CLIENT.get_or_init(|| RwLock::new(build_client()))
}

/// The shared client.  `reqwest::Client` is internally reference-counted, so
/// the clone is cheap and callers never hold the lock across a request.
pub fn client() -> reqwest::Client {
    slot().read().clone()
}

/// Drop all idle pooled connections by replacing the client.  In-flight
/// requests on the old pool complete undisturbed.
pub fn refresh_pool() {
    *slot().write() = build_client();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_is_reused_across_calls() {
        // Two calls must not panic and must hand out usable clients.
        let _a = client();
        let _b = client();
    }

    #[test]
    fn refresh_pool_swaps_client() {
        let _before = client();
        refresh_pool();
        let _after = client();
    }
}
