//! Deterministic fault classification.
//!
//! Classification is total and rule-based: every fault maps to exactly one
//! category through a fixed priority order. Structured fields (HTTP status,
//! transport code) are checked before message markers, and status codes
//! embedded in message text are matched with digit boundaries so "4291"
//! never reads as a 429.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FaultPayload;

/// Retry-eligibility category attached to every fault. Computed per fault,
/// never stored on the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClassification {
    /// 5xx-style server faults expected to clear on their own.
    TransientService,
    /// Explicit throttling (429, quota markers, Retry-After).
    RateLimited,
    /// Transport-level failures: refused/reset connections, DNS, socket codes.
    Network,
    /// The request itself is malformed; retrying the same bytes cannot help.
    Validation,
    /// Credential problems; eligible for one token refresh, not for backoff.
    Authorization,
    /// The attempt exceeded its time budget.
    Timeout,
    /// Nothing matched. Treated as non-retryable by every default policy.
    Unclassified,
}

impl FaultClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientService => "transient_service",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::Timeout => "timeout",
            Self::Unclassified => "unclassified",
        }
    }

    /// Categories every default policy treats as safe to retry.
    pub fn default_retryable() -> &'static [FaultClassification] {
        &[
            Self::TransientService,
            Self::RateLimited,
            Self::Network,
            Self::Timeout,
        ]
    }
}

impl std::fmt::Display for FaultClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Server-provided guidance on when a throttled call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHint {
    pub retry_after: Option<Duration>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitHint {
    /// Wait measured from `now`, if the hint carries usable timing.
    /// A reset already in the past collapses to zero.
    pub fn wait_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(wait) = self.retry_after {
            return Some(wait);
        }
        if let Some(reset_at) = self.reset_at {
            let until = reset_at.signed_duration_since(now);
            return Some(until.to_std().unwrap_or(Duration::ZERO));
        }
        None
    }
}

/// Map a fault to its classification.
///
/// Priority order: rate-limit markers, then server errors, then transport
/// markers, then validation, then authorization, then timeout. Anything
/// left over is `Unclassified`.
///
/// The retry engine's own per-attempt timeout is checked structurally before
/// any marker scan; a budget like 429ms or 500ms renders into the message and
/// must not be mistaken for an HTTP status.
pub fn classify(fault: &FaultPayload) -> FaultClassification {
    if fault.attempt_timed_out {
        return FaultClassification::Timeout;
    }

    let message = fault.message.to_lowercase();
    let code = fault
        .code
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    if is_rate_limited(fault, &message, &code) {
        FaultClassification::RateLimited
    } else if is_transient_service(fault, &message) {
        FaultClassification::TransientService
    } else if is_network(&message, &code) {
        FaultClassification::Network
    } else if is_validation(fault, &message, &code) {
        FaultClassification::Validation
    } else if is_authorization(fault, &message, &code) {
        FaultClassification::Authorization
    } else if is_timeout(fault, &message, &code) {
        FaultClassification::Timeout
    } else {
        FaultClassification::Unclassified
    }
}

/// Extract server-provided retry timing from a fault, if any.
///
/// Structured fields win; otherwise the message is scanned for an RFC 7231
/// style `Retry-After:` header fragment. Prose forms ("retry after 30
/// seconds") are intentionally not parsed; they vary by locale.
pub fn rate_limit_hint(fault: &FaultPayload) -> Option<RateLimitHint> {
    if fault.retry_after.is_some() || fault.reset_at.is_some() {
        return Some(RateLimitHint {
            retry_after: fault.retry_after,
            reset_at: fault.reset_at,
        });
    }
    parse_retry_after(&fault.message).map(|secs| RateLimitHint {
        retry_after: Some(Duration::from_secs(secs)),
        reset_at: None,
    })
}

fn is_rate_limited(fault: &FaultPayload, message: &str, code: &str) -> bool {
    if fault.status == Some(429) {
        return true;
    }
    if code.contains("rate_limit") || code.contains("rate-limit") || code == "too_many_requests" {
        return true;
    }
    message.contains("rate limit")
        || message.contains("too many requests")
        || message.contains("quota exceeded")
        || contains_http_code(message, 429)
}

fn is_transient_service(fault: &FaultPayload, message: &str) -> bool {
    if let Some(status) = fault.status {
        if (500..=599).contains(&status) {
            return true;
        }
    }
    for status in [500u16, 502, 503, 504] {
        if contains_http_code(message, status) {
            return true;
        }
    }
    message.contains("internal server error")
        || message.contains("service unavailable")
        || message.contains("bad gateway")
        || message.contains("server overloaded")
}

fn is_network(message: &str, code: &str) -> bool {
    const MARKERS: &[&str] = &[
        "connection refused",
        "connection reset",
        "connection aborted",
        "connection closed",
        "dns",
        "name resolution",
        "no route to host",
        "network unreachable",
        "broken pipe",
        "socket hang up",
        "econnrefused",
        "econnreset",
        "etimedout",
    ];
    if MARKERS.iter().any(|marker| message.contains(marker)) {
        return true;
    }
    // Transport errno-style codes: ECONNREFUSED, ECONNRESET, ETIMEDOUT,
    // EAI_AGAIN. ETIMEDOUT is a socket-level timeout and stays in Network.
    code.starts_with("econn") || code == "etimedout" || code.starts_with("eai_")
}

fn is_validation(fault: &FaultPayload, message: &str, code: &str) -> bool {
    if matches!(fault.status, Some(400) | Some(422)) {
        return true;
    }
    if contains_http_code(message, 400) || contains_http_code(message, 422) {
        return true;
    }
    // "invalid" alone is too broad; "invalid token" belongs to Authorization.
    code.contains("validation")
        || code.contains("invalid_request")
        || message.contains("validation")
        || message.contains("bad request")
        || message.contains("unprocessable")
        || message.contains("malformed")
        || message.contains("invalid parameter")
        || message.contains("missing required")
}

fn is_authorization(fault: &FaultPayload, message: &str, code: &str) -> bool {
    if matches!(fault.status, Some(401) | Some(403)) {
        return true;
    }
    if contains_http_code(message, 401) || contains_http_code(message, 403) {
        return true;
    }
    code.contains("unauthorized") || code.contains("forbidden") || code.contains("auth")
        || message.contains("unauthorized")
        || message.contains("forbidden")
        || message.contains("authentication")
        || message.contains("permission denied")
        || message.contains("access denied")
        || message.contains("token expired")
        || message.contains("invalid token")
        || message.contains("invalid credential")
        || message.contains("invalid api key")
}

fn is_timeout(fault: &FaultPayload, message: &str, code: &str) -> bool {
    if fault.status == Some(408) {
        return true;
    }
    if contains_http_code(message, 408) {
        return true;
    }
    code.contains("timeout")
        || message.contains("timed out")
        || message.contains("timeout")
        || message.contains("deadline exceeded")
}

/// Check whether a message contains an HTTP status code with digit
/// boundaries on both sides, so "4291" never matches 429.
fn contains_http_code(message: &str, code: u16) -> bool {
    let code_str = code.to_string();
    let bytes = message.as_bytes();

    for (i, _) in message.match_indices(&code_str) {
        let before_ok = i == 0
            || !bytes
                .get(i - 1)
                .map(|&b| b.is_ascii_digit())
                .unwrap_or(false);
        let after_ok = i + code_str.len() >= message.len()
            || !bytes
                .get(i + code_str.len())
                .map(|&b| b.is_ascii_digit())
                .unwrap_or(false);

        if before_ok && after_ok {
            return true;
        }
    }

    false
}

/// Parse a Retry-After value embedded in message text.
///
/// Only the RFC 7231 header form ("Retry-After: 30", case-insensitive) is
/// recognized, and only the delta-seconds variant; HTTP-date values are
/// ignored.
fn parse_retry_after(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    let pos = lower.find("retry-after:")?;
    let after_colon = &lower[pos + "retry-after:".len()..];
    extract_number_from_start(after_colon)
}

fn extract_number_from_start(s: &str) -> Option<u64> {
    let trimmed = s.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
