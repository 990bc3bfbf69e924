//! Council Scheduler: fans one prompt out to every reviewer with bounded
//! parallelism, per-reviewer timeout, and retry with respawn. One reviewer's
//! failure never fails the review.

use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{info, warn};

use crate::agent::AgentRuntime;
use crate::config::{DEFAULT_REVIEWER_TIMEOUT_MS, ReviewerSpec};
use crate::error::Result;
use crate::events::{EventSink, ProgressStatus};
use crate::retry::{retry_with_backoff, sanitize_error_message};
use crate::review::{IndividualReview, ReviewStatus};

/// Reviewers run in chunks of at most this many concurrent subprocesses.
pub const MAX_REVIEWER_CONCURRENCY: usize = 5;

/// Run the whole council against one prompt. Chunks run sequentially; within
/// a chunk, reviewers run in parallel. `double_timeout` is set when the
/// effective mode is explore with no inline code (tool round-trips are slow).
pub async fn run_council(
    runtime: &AgentRuntime,
    reviewers: &[ReviewerSpec],
    prompt: &str,
    double_timeout: bool,
    sink: &dyn EventSink,
) -> Vec<IndividualReview> {
    // Placeholders first: every reviewer's `sending` goes out before any
    // delta from any session.
    for spec in reviewers {
        sink.progress(&spec.name, ProgressStatus::Sending, None, None);
    }
    let mut reviews = Vec::with_capacity(reviewers.len());
    for chunk in reviewers.chunks(MAX_REVIEWER_CONCURRENCY) {
        let outcomes =
            join_all(chunk.iter().map(|spec| review_one(runtime, spec, prompt, double_timeout, sink)))
                .await;
        reviews.extend(outcomes);
    }
    reviews
}

async fn review_one(
    runtime: &AgentRuntime,
    spec: &ReviewerSpec,
    prompt: &str,
    double_timeout: bool,
    sink: &dyn EventSink,
) -> IndividualReview {
    let started = Instant::now();

    let outcome = run_reviewer(runtime, spec, prompt, double_timeout, sink).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(review) => {
            info!(reviewer = %spec.name, duration_ms, "reviewer finished");
            sink.progress(&spec.name, ProgressStatus::Done, Some(duration_ms), None);
            IndividualReview {
                reviewer: spec.name.clone(),
                review,
                status: ReviewStatus::Success,
                duration_ms,
            }
        }
        Err(err) => {
            let sanitized = sanitize_error_message(&err.to_string());
            warn!(reviewer = %spec.name, duration_ms, error = %sanitized, "reviewer failed");
            sink.progress(&spec.name, ProgressStatus::Error, Some(duration_ms), Some(&sanitized));
            IndividualReview {
                reviewer: spec.name.clone(),
                review: format!("[error] Review generation failed for {}", spec.name),
                status: ReviewStatus::Error,
                duration_ms,
            }
        }
    }
}

async fn run_reviewer(
    runtime: &AgentRuntime,
    spec: &ReviewerSpec,
    prompt: &str,
    double_timeout: bool,
    sink: &dyn EventSink,
) -> Result<String> {
    let mut timeout_ms = spec.effective_timeout_ms(DEFAULT_REVIEWER_TIMEOUT_MS);
    if double_timeout {
        timeout_ms *= 2;
    }
    let timeout = Duration::from_millis(timeout_ms);

    let handle_slot = tokio::sync::Mutex::new(runtime.spawn(spec).await?);
    let slot = &handle_slot;

    let result = retry_with_backoff(
        spec.effective_max_retries(),
        &spec.name,
        || async move {
            let handle = slot.lock().await.clone();
            handle.prompt(prompt, timeout, sink).await
        },
        || async move {
            // Tear the old subprocess down and start fresh. A failed respawn
            // aborts the retry loop; the old handle is already stopped.
            let old = slot.lock().await.clone();
            if let Err(e) = runtime.stop(&old).await {
                warn!(reviewer = %spec.name, error = %e, "failed to stop agent before respawn");
            }
            let fresh = runtime.spawn(spec).await?;
            *slot.lock().await = fresh;
            Ok(())
        },
    )
    .await;

    let handle = handle_slot.lock().await.clone();
    if let Err(e) = runtime.stop(&handle).await {
        warn!(reviewer = %spec.name, error = %e, "failed to stop agent");
    }

    result
}
