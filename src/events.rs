//! Per-review event streams: the pipeline publishes tagged events, exactly
//! one subscriber consumes them in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::review::ReviewResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Sending,
    Done,
    Error,
}

/// A tagged review event, serialized as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ReviewEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        reviewer: String,
        status: ProgressStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Delta { reviewer: String, content: String },
    #[serde(rename_all = "camelCase")]
    ToolActivity {
        reviewer: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<String>,
    },
    Result(ReviewResult),
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where review progress goes. The pipeline and the agent runtime write
/// through this; the per-review publisher is the production implementation.
pub trait EventSink: Send + Sync {
    fn progress(
        &self,
        reviewer: &str,
        status: ProgressStatus,
        duration_ms: Option<u64>,
        error: Option<&str>,
    );
    fn delta(&self, reviewer: &str, content: &str);
    fn tool_activity(&self, reviewer: &str, tool_name: &str, args: Option<&str>);
    fn result(&self, result: &ReviewResult);
    fn error(&self, message: &str);
}

/// Sink that drops everything. Useful for callers without a stream.
pub struct NullSink;

impl EventSink for NullSink {
    fn progress(&self, _: &str, _: ProgressStatus, _: Option<u64>, _: Option<&str>) {}
    fn delta(&self, _: &str, _: &str) {}
    fn tool_activity(&self, _: &str, _: &str, _: Option<&str>) {}
    fn result(&self, _: &ReviewResult) {}
    fn error(&self, _: &str) {}
}

/// Publisher half of one review's stream. Dropped (or completed) exactly
/// once; events after the terminal `result`/`error` are discarded.
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<ReviewEvent>,
    completed: AtomicBool,
}

impl EventPublisher {
    fn send(&self, event: ReviewEvent) {
        if self.completed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(event);
    }

    fn send_terminal(&self, event: ReviewEvent) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(event);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl EventSink for EventPublisher {
    fn progress(
        &self,
        reviewer: &str,
        status: ProgressStatus,
        duration_ms: Option<u64>,
        error: Option<&str>,
    ) {
        self.send(ReviewEvent::Progress {
            reviewer: reviewer.to_string(),
            status,
            duration_ms,
            error: error.map(str::to_string),
            timestamp: now_millis(),
        });
    }

    fn delta(&self, reviewer: &str, content: &str) {
        self.send(ReviewEvent::Delta {
            reviewer: reviewer.to_string(),
            content: content.to_string(),
        });
    }

    fn tool_activity(&self, reviewer: &str, tool_name: &str, args: Option<&str>) {
        self.send(ReviewEvent::ToolActivity {
            reviewer: reviewer.to_string(),
            tool_name: tool_name.to_string(),
            args: args.map(str::to_string),
        });
    }

    fn result(&self, result: &ReviewResult) {
        self.send_terminal(ReviewEvent::Result(result.clone()));
    }

    fn error(&self, message: &str) {
        self.send_terminal(ReviewEvent::Error { message: message.to_string() });
    }
}

struct StreamSlot {
    receiver: Option<mpsc::UnboundedReceiver<ReviewEvent>>,
}

/// Registry of live review streams, keyed by review id.
#[derive(Default)]
pub struct EventBus {
    streams: Mutex<HashMap<String, StreamSlot>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a stream for a review id and hand back its publisher.
    pub fn create(&self, review_id: &str) -> Arc<EventPublisher> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut streams = self.streams.lock().expect("event bus lock poisoned");
        streams.insert(review_id.to_string(), StreamSlot { receiver: Some(rx) });
        Arc::new(EventPublisher { tx, completed: AtomicBool::new(false) })
    }

    /// Take the single subscription for a review id.
    pub fn subscribe(&self, review_id: &str) -> Result<mpsc::UnboundedReceiver<ReviewEvent>> {
        let mut streams = self.streams.lock().expect("event bus lock poisoned");
        let slot = streams
            .get_mut(review_id)
            .ok_or_else(|| Error::Events(format!("review stream not found: {review_id}")))?;
        slot.receiver
            .take()
            .ok_or_else(|| Error::Events(format!("review stream already subscribed: {review_id}")))
    }

    /// Drop a stream (subscriber disconnected or review finished).
    pub fn remove(&self, review_id: &str) {
        let mut streams = self.streams.lock().expect("event bus lock poisoned");
        streams.remove(review_id);
    }
}
