//! Error classification
//!
//! Worker bodies report failures as strings; classification maps them onto
//! the error taxonomy. Unrecognized errors default to `retryable` so that
//! transient infrastructure problems get retried.

use crate::job::ErrorClass;

/// Markers for errors that retrying cannot fix.
const PERMANENT_MARKERS: &[&str] = &[
    "unknown handler",
    "unregistered handler",
    "invalid argument",
    "bad args",
    "malformed",
];

/// Markers for explicit backoff requests from downstream services.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate-limited", "429", "too many requests"];

/// Classify a failure message.
///
/// Explicit prefixes win: a body may return `"permanent: ..."` or
/// `"rate_limited: ..."` to pick its class directly.
pub fn classify(message: &str) -> ErrorClass {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return ErrorClass::Unknown;
    }
    let lower = trimmed.to_ascii_lowercase();

    if lower.starts_with("permanent:") {
        return ErrorClass::Permanent;
    }
    if lower.starts_with("rate_limited:") {
        return ErrorClass::RateLimited;
    }

    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::RateLimited;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorClass::Timeout;
    }
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Permanent;
    }

    ErrorClass::Retryable
}
