// =============================================================================
// Scheduler Engine (C6) — TaskInstance state machine, priority queue, retry
// =============================================================================
//
// `TaskInstance` transitions are expressed as methods that check the current
// state before mutating, rather than direct field writes, so the state
// machine in spec.md §4.6 is structurally hard to violate (I3, I5). The
// engine itself (the tick loop, worker pool, per-attempt protocol) lives in
// `engine.rs`; retry/backoff math lives in `retry.rs`.
// =============================================================================

pub mod engine;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::types::{CorrelationId, TaskId};

pub use engine::{SchedulerEngine, SchedulerHandle};

/// Every state `TaskInstance` can occupy, per spec.md §4.6's diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    FailedTransient,
    FailedPermanent,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedPermanent | Self::Cancelled)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One scheduled firing of a `TaskDefinition`. Created when its trigger
/// fires; retained after reaching a terminal state for history, per
/// spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: Uuid,
    pub task_id: TaskId,
    pub correlation_id: CorrelationId,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: u32,
    pub state: TaskState,
    pub last_error: Option<String>,
    pub cancel_reason: Option<String>,
    /// Number of elapsed fire times coalesced into this single firing, per
    /// the "missed fires during downtime" decision in SPEC_FULL.md §0.
    pub coalesced_misses: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a `FAILED_TRANSIENT` instance may requeue to `PENDING`.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(task_id: TaskId, correlation_id: CorrelationId, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            correlation_id,
            scheduled_at,
            attempt: 0,
            state: TaskState::Pending,
            last_error: None,
            cancel_reason: None,
            coalesced_misses: 0,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
        }
    }

    fn transition(&mut self, to: TaskState, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let allowed = matches!(
            (self.state, to),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::FailedTransient)
                | (TaskState::Running, TaskState::FailedPermanent)
                | (TaskState::Running, TaskState::TimedOut)
                | (TaskState::Running, TaskState::Cancelled)
                | (TaskState::FailedTransient, TaskState::Pending)
                | (TaskState::FailedTransient, TaskState::FailedPermanent)
                | (TaskState::FailedTransient, TaskState::Cancelled)
                | (TaskState::TimedOut, TaskState::FailedTransient)
                | (TaskState::TimedOut, TaskState::FailedPermanent)
        );
        if !allowed {
            return Err(SchedulerError::InvalidTransition(self.id, self.state.name(), to.name()));
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.attempt += 1;
        self.transition(TaskState::Running, now)
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.transition(TaskState::Succeeded, now)
    }

    /// Marks a transient failure and, if `max_retries` is not yet exhausted,
    /// schedules a backoff-delayed requeue to `PENDING`. Crossing
    /// `max_retries` promotes straight to `FAILED_PERMANENT` (I5).
    pub fn fail_transient(
        &mut self,
        reason: &str,
        max_retries: u32,
        backoff: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.last_error = Some(reason.to_string());
        self.transition(TaskState::FailedTransient, now)?;
        if self.attempt > max_retries {
            self.transition(TaskState::FailedPermanent, now)
        } else {
            self.next_retry_at = Some(now + backoff);
            self.transition(TaskState::Pending, now)
        }
    }

    pub fn fail_permanent(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.last_error = Some(reason.to_string());
        self.transition(TaskState::FailedPermanent, now)
    }

    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.transition(TaskState::TimedOut, now)
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.cancel_reason = Some(reason.to_string());
        self.transition(TaskState::Cancelled, now)
    }
}

// =============================================================================
// Priority ordering for the ready queue (spec.md §4.6 "Priority")
// =============================================================================

/// Orders due `PENDING` instances as (higher priority, earlier scheduled
/// time, lexicographic id) — a max-heap on this type pops the right task
/// first.
#[derive(Debug, Clone)]
pub struct ReadyKey {
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub task_id: TaskId,
    pub instance_id: Uuid,
}

impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.scheduled_at == other.scheduled_at && self.task_id == other.task_id
    }
}
impl Eq for ReadyKey {}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_at.cmp(&self.scheduled_at))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst() -> TaskInstance {
        TaskInstance::new(TaskId("t1".into()), Uuid::new_v4(), Utc::now(), Utc::now())
    }

    #[test]
    fn pending_to_running_to_succeeded() {
        let mut i = inst();
        i.start(Utc::now()).unwrap();
        assert_eq!(i.state, TaskState::Running);
        assert_eq!(i.attempt, 1);
        i.succeed(Utc::now()).unwrap();
        assert_eq!(i.state, TaskState::Succeeded);
    }

    #[test]
    fn halted_cannot_go_running_directly_from_cancelled() {
        let mut i = inst();
        i.cancel("upstream_failed", Utc::now()).unwrap();
        assert!(i.start(Utc::now()).is_err());
    }

    #[test]
    fn transient_failure_requeues_until_budget_exhausted_i5() {
        let mut i = inst();
        let max_retries = 2;
        for attempt in 1..=3 {
            i.start(Utc::now()).unwrap();
            assert_eq!(i.attempt, attempt);
            i.fail_transient("boom", max_retries, chrono::Duration::seconds(1), Utc::now())
                .unwrap();
        }
        assert_eq!(i.state, TaskState::FailedPermanent);
        assert_eq!(i.attempt, 3);
        assert!(i.attempt <= max_retries + 1);
    }

    #[test]
    fn ready_key_orders_by_priority_then_time_then_id() {
        let t0 = Utc::now();
        let high = ReadyKey { priority: 5, scheduled_at: t0, task_id: TaskId("b".into()), instance_id: Uuid::new_v4() };
        let low = ReadyKey { priority: 1, scheduled_at: t0, task_id: TaskId("a".into()), instance_id: Uuid::new_v4() };
        assert!(high > low);

        let earlier = ReadyKey { priority: 1, scheduled_at: t0 - chrono::Duration::seconds(5), task_id: TaskId("z".into()), instance_id: Uuid::new_v4() };
        let later = ReadyKey { priority: 1, scheduled_at: t0, task_id: TaskId("a".into()), instance_id: Uuid::new_v4() };
        assert!(earlier > later);
    }
}
