//! Retry classification, exponential backoff, and error-message redaction.

use std::future::Future;
use std::io::ErrorKind;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Base delay for the exponential backoff: 2000 * 2^attempt ms.
pub const BACKOFF_BASE_MS: u64 = 2000;

const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "timed out",
    "timeout",
    "empty response",
    "failed to list models",
    "econnreset",
    "econnrefused",
    "eai_again",
    "socket hang up",
];

const NON_RETRYABLE_SUBSTRINGS: &[&str] = &["invalid token", "unauthorized", "authentication"];

/// Whether an error is worth retrying. Structured io kinds are preferred;
/// everything else falls back to a case-insensitive message substring match.
pub fn is_retryable(err: &Error) -> bool {
    if let Error::Io(io_err) = err {
        match io_err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe => return true,
            _ => {}
        }
    }
    let msg = err.to_string().to_lowercase();
    if NON_RETRYABLE_SUBSTRINGS.iter().any(|s| msg.contains(s)) {
        return false;
    }
    RETRYABLE_SUBSTRINGS.iter().any(|s| msg.contains(s))
}

/// Run `attempt` up to `max_retries + 1` times. Between attempts, sleep the
/// backoff delay and then await `on_retry` (used to tear down and respawn the
/// agent). If `on_retry` itself fails, that failure propagates and retrying
/// stops. Non-retryable errors propagate immediately.
pub async fn retry_with_backoff<T, F, Fut, R, RFut>(
    max_retries: u32,
    label: &str,
    mut attempt: F,
    mut on_retry: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = Result<()>>,
{
    let mut attempt_no: u32 = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt_no >= max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay_ms = BACKOFF_BASE_MS * (1u64 << attempt_no.min(16));
                warn!(
                    label,
                    attempt = attempt_no + 1,
                    delay_ms,
                    error = %sanitize_error_message(&err.to_string()),
                    "attempt failed, backing off"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                on_retry().await?;
                attempt_no += 1;
                info!(label, attempt = attempt_no + 1, "retrying");
            }
        }
    }
}

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

static SECRET_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:sk-|ghp_|glpat-)[A-Za-z0-9_-]{4,}").unwrap());

static SECRET_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=_-]{32,}").unwrap());

/// Redact secret-looking material from an error message before it crosses a
/// process boundary or lands in a log line. Canonical UUIDs are preserved.
/// Idempotent: sanitizing a sanitized message is a no-op.
pub fn sanitize_error_message(message: &str) -> String {
    let pass1 = SECRET_PREFIX_RE.replace_all(message, "[REDACTED]");
    SECRET_RUN_RE
        .replace_all(&pass1, |caps: &regex::Captures<'_>| {
            let m = &caps[0];
            if UUID_RE.is_match(m) { m.to_string() } else { "[REDACTED]".to_string() }
        })
        .into_owned()
}
