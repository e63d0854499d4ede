//! EventSink implementations.

use tokio::sync::broadcast;
use tracing::info;

use crate::domain::TransitionRecord;
use crate::ports::EventSink;

/// Drops every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _record: &TransitionRecord) {}
}

/// Mirrors transitions into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, record: &TransitionRecord) {
        info!(
            target: "fixflow::events",
            task_id = %record.task_id,
            from = %record.from,
            to = %record.to,
            event = ?record.event,
            reason = record.reason.as_deref().unwrap_or(""),
            "transition"
        );
    }
}

/// Fans records out to any number of subscribers.
///
/// Slow subscribers lose the oldest records (`RecvError::Lagged`); emitting
/// never blocks the pipeline.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TransitionRecord>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionRecord> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, record: &TransitionRecord) {
        // No subscribers is fine.
        let _ = self.tx.send(record.clone());
    }
}
