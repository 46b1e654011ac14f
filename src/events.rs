// =============================================================================
// Event Bus (C7) — append-only, topic-sequenced pub/sub for state changes
// =============================================================================
//
// Built on `tokio::sync::broadcast`: slow subscribers are dropped, not
// back-pressured, per spec.md §5 ("the bus favors availability over
// delivery"). Each topic carries its own monotonically increasing sequence
// number so a subscriber that misses events can detect the gap from
// `seq` alone, satisfying invariant I6.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::allocator::AllocationTarget;
use crate::risk::{ActionProposal, Decision, RiskState};
use crate::types::{CorrelationId, ProtocolId, Severity, TaskId};

/// Topic names are fixed strings; the bus does not support dynamic topic
/// creation beyond what the core components publish to.
pub const TOPIC_RISK: &str = "risk";
pub const TOPIC_ALLOCATION: &str = "allocation";
pub const TOPIC_TASKS: &str = "tasks";
pub const TOPIC_SYSTEM: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    RiskStateChanged {
        from: RiskState,
        to: RiskState,
        reason: String,
    },
    ActionDecided {
        proposal: ActionProposal,
        decision: Decision,
    },
    ReservationReleased {
        correlation_id: CorrelationId,
    },
    AllocationRebalanced {
        targets: Vec<AllocationTarget>,
    },
    AllocationDriftDetected {
        protocol: ProtocolId,
        drift: f64,
    },
    TaskScheduled {
        task_id: TaskId,
        correlation_id: CorrelationId,
    },
    TaskStateChanged {
        task_id: TaskId,
        from: String,
        to: String,
    },
    TaskExhausted {
        task_id: TaskId,
        attempts: u32,
    },
    SchedulerModeChanged {
        running: bool,
    },
}

/// A single published event: a topic, a per-topic sequence number, and a
/// timestamp, wrapping an [`EventKind`] payload. Events are never mutated or
/// retracted once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub kind: EventKind,
}

struct TopicState {
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
}

/// Bounded-buffer pub/sub bus. Each topic gets its own broadcast channel so a
/// lagging subscriber on one topic cannot stall publishers on another.
pub struct EventBus {
    capacity: usize,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        let mut topics = self.topics.lock();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(self.capacity);
                Arc::new(TopicState {
                    seq: AtomicU64::new(0),
                    tx,
                })
            })
            .clone()
    }

    /// Publish `kind` on `topic`, assigning the next sequence number for that
    /// topic. Returns the published [`Event`] regardless of whether any
    /// subscriber was listening.
    pub fn publish(&self, topic: &str, severity: Severity, kind: EventKind) -> Event {
        let state = self.topic(topic);
        let seq = state.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            seq,
            at: Utc::now(),
            severity,
            kind,
        };
        // Err(SendError) only happens with zero receivers; that's fine, the
        // event is still considered published and sequenced.
        if state.tx.send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        self.topic(topic).tx.subscribe()
    }

    /// Count of publishes that had zero active subscribers at send time.
    /// Does not count receiver-side lag drops (those are surfaced by
    /// `broadcast::Receiver` returning `RecvError::Lagged`).
    pub fn unreceived_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically_per_topic() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe(TOPIC_SYSTEM);
        bus.publish(
            TOPIC_SYSTEM,
            Severity::Info,
            EventKind::SchedulerModeChanged { running: true },
        );
        bus.publish(
            TOPIC_SYSTEM,
            Severity::Info,
            EventKind::SchedulerModeChanged { running: false },
        );
        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new(16);
        bus.publish(
            TOPIC_RISK,
            Severity::Warning,
            EventKind::RiskStateChanged {
                from: RiskState::Normal,
                to: RiskState::Degraded,
                reason: "test".into(),
            },
        );
        let mut rx = bus.subscribe(TOPIC_TASKS);
        let e = bus.publish(
            TOPIC_TASKS,
            Severity::Info,
            EventKind::TaskScheduled {
                task_id: TaskId("t1".into()),
                correlation_id: Uuid::new_v4(),
            },
        );
        assert_eq!(e.seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
    }

    #[test]
    fn publish_with_no_subscribers_counts_as_unreceived() {
        let bus = EventBus::new(16);
        bus.publish(
            TOPIC_SYSTEM,
            Severity::Info,
            EventKind::SchedulerModeChanged { running: true },
        );
        assert_eq!(bus.unreceived_count(), 1);
    }
}
