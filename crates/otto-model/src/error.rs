// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by provider drivers.
///
/// The retry layer classifies these: `Api` errors by status/kind, `Stream`
/// and `Http` errors by their transient nature.  Everything else is fatal.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A non-2xx HTTP response with a parsed body.
    #[error("{kind} ({status}): {message}")]
    Api {
        status: u16,
        /// Error type from the body, e.g. `rate_limit_error`,
        /// `invalid_request_error`.  Empty when the body was unparseable.
        kind: String,
        message: String,
        /// Server-directed retry hint from `retry-after-ms` / `Retry-After`.
        retry_after: Option<Duration>,
    },
    /// The response stream broke mid-flight (EOF, reset, bad chunking).
    #[error("reading stream: {0}")]
    Stream(String),
    /// The request itself could not be sent.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Missing key, unknown provider id, bad configuration.  Never retried.
    #[error("{0}")]
    Config(String),
}

impl ProviderError {
    /// The server's retry hint, when one was provided.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Build an `Api` error from a non-success response.
    ///
    /// Bodies of the shape `{"error":{"type":"…","message":"…"}}` (shared by
    /// both wire families) are parsed; anything else keeps the raw text as
    /// the message.
    pub fn from_response(status: u16, headers: &HeaderMap, body: &str) -> Self {
        let (kind, message) = parse_error_body(body);
        Self::Api {
            status,
            kind,
            message,
            retry_after: parse_retry_after(headers),
        }
    }
}

fn parse_error_body(body: &str) -> (String, String) {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let err = if v.get("error").is_some() { &v["error"] } else { &v };
        let kind = err["type"].as_str().unwrap_or("").to_string();
        let message = err["message"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| body.trim().to_string());
        if !kind.is_empty() || !message.is_empty() {
            return (kind, message);
        }
    }
    (String::new(), body.trim().to_string())
}

/// Extract a retry hint from response headers.
///
/// `retry-after-ms` carries milliseconds; `Retry-After` carries either whole
/// seconds or an HTTP-date.  The millisecond header wins when both are
/// present (it is the more precise signal).
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_millis(ms));
    }
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form: the hint is the distance from now, clamped at zero for
    // dates already in the past.
    let when = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = when.signed_duration_since(chrono::Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn retry_after_ms_parsed_as_milliseconds() {
        let h = headers(&[("retry-after-ms", "1500")]);
        assert_eq!(parse_retry_after(&h), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn retry_after_seconds_parsed() {
        let h = headers(&[("retry-after", "7")]);
        assert_eq!(parse_retry_after(&h), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_ms_wins_over_retry_after() {
        let h = headers(&[("retry-after-ms", "250"), ("retry-after", "60")]);
        assert_eq!(parse_retry_after(&h), Some(Duration::from_millis(250)));
    }

    #[test]
    fn retry_after_http_date_in_past_clamps_to_zero() {
        let h = headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")]);
        assert_eq!(parse_retry_after(&h), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_garbage_is_none() {
        let h = headers(&[("retry-after", "soon")]);
        assert_eq!(parse_retry_after(&h), None);
    }

    #[test]
    fn no_headers_is_none() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn from_response_parses_nested_error_body() {
        let body = r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let e = ProviderError::from_response(429, &HeaderMap::new(), body);
        match e {
            ProviderError::Api {
                status,
                kind,
                message,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(kind, "rate_limit_error");
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn from_response_keeps_raw_text_when_unparseable() {
        let e = ProviderError::from_response(503, &HeaderMap::new(), "upstream unavailable");
        match e {
            ProviderError::Api { kind, message, .. } => {
                assert!(kind.is_empty());
                assert_eq!(message, "upstream unavailable");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn from_response_attaches_retry_hint() {
        let h = headers(&[("retry-after-ms", "100")]);
        let e = ProviderError::from_response(429, &h, "{}");
        assert_eq!(e.retry_after(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn display_includes_kind_status_and_message() {
        let e = ProviderError::Api {
            status: 400,
            kind: "invalid_request_error".into(),
            message: "unknown model".into(),
            retry_after: None,
        };
        let s = e.to_string();
        assert!(s.contains("invalid_request_error"));
        assert!(s.contains("400"));
        assert!(s.contains("unknown model"));
    }
}
