//! Run status events
//!
//! `StatusEvent` is the vocabulary of the live status stream: the StatusReporter
//! appends each event as one JSON line to the run's status file, and republishes it
//! on an [`EventBus`] for in-process subscribers.

use crate::models::{ItemId, Stage, StageOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Run progress event
///
/// Serialized with an `"event"` tag so a tailing viewer can dispatch on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Sequencer started (or resumed) a run
    RunStarted {
        run_id: Uuid,
        run_name: String,
        stages: Vec<Stage>,
        item_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A stage pass started
    StageStarted {
        stage: Stage,
        /// Items that will be processed in this pass
        item_count: usize,
        /// Eligible items already done according to the ledger
        previously_completed: usize,
        timestamp: DateTime<Utc>,
    },

    /// One item reached a terminal outcome for a stage
    ItemOutcome {
        item_id: ItemId,
        path: String,
        stage: Stage,
        outcome: StageOutcome,
        /// Backend calls made for this item (0 when no call was needed)
        attempts: u32,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Every eligible item has a terminal outcome for the stage
    StageCompleted {
        stage: Stage,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        previously_completed: usize,
        timestamp: DateTime<Utc>,
    },

    /// All stages finished
    RunCompleted {
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Run stopped early
    RunAborted {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl StatusEvent {
    /// Event tag as written to the status file
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::RunStarted { .. } => "run_started",
            StatusEvent::StageStarted { .. } => "stage_started",
            StatusEvent::ItemOutcome { .. } => "item_outcome",
            StatusEvent::StageCompleted { .. } => "stage_completed",
            StatusEvent::RunCompleted { .. } => "run_completed",
            StatusEvent::RunAborted { .. } => "run_aborted",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StatusEvent::RunStarted { timestamp, .. }
            | StatusEvent::StageStarted { timestamp, .. }
            | StatusEvent::ItemOutcome { timestamp, .. }
            | StatusEvent::StageCompleted { timestamp, .. }
            | StatusEvent::RunCompleted { timestamp, .. }
            | StatusEvent::RunAborted { timestamp, .. } => *timestamp,
        }
    }
}

/// In-process broadcast of status events
///
/// Cloning shares the underlying channel. Slow subscribers lose the oldest events
/// once `capacity` is exceeded; the status file remains the complete record.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// ```
    /// use idt_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(256);
    /// assert_eq!(event_bus.capacity(), 256);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_as_single_tagged_line() {
        let event = StatusEvent::ItemOutcome {
            item_id: ItemId::from("abc"),
            path: "/photos/a.jpg".to_string(),
            stage: Stage::Describe,
            outcome: StageOutcome::failed("rate limited\nby provider"),
            attempts: 3,
            duration_ms: 1200,
            error_kind: Some("rate_limited".to_string()),
            timestamp: Utc::now(),
        };

        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with(r#"{"event":"item_outcome""#));

        let back: StatusEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.name(), "item_outcome");
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit_lossy(StatusEvent::RunAborted {
            reason: "cancelled".to_string(),
            timestamp: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "run_aborted");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit_lossy(StatusEvent::RunAborted {
            reason: "nobody listening".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
