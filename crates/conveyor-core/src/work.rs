use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryBehavior;
use crate::task_result::{TaskError, TaskResult};
use crate::value::ValueRef;

/// Unique identifier of an enqueued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct WorkId(Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of handler a work item executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Opaque, possibly non-deterministic, possibly side-effecting call.
    Action,
    /// Transactional write against the caller's own store.
    Mutation,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Action => "action",
            WorkKind::Mutation => "mutation",
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be admitted (possibly delayed, possibly between retries).
    Pending,
    /// An attempt is currently executing.
    Running,
    /// Terminal: the last attempt produced a value.
    Succeeded,
    /// Terminal: retries exhausted or not permitted.
    Failed,
    /// Terminal: canceled before producing its own outcome.
    Canceled,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Succeeded | WorkStatus::Failed | WorkStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Succeeded => "succeeded",
            WorkStatus::Failed => "failed",
            WorkStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptOutcome {
    /// The handler returned a value.
    Succeeded { value: ValueRef },
    /// The handler returned or threw an error.
    Failed { error: TaskError },
    /// The process restarted while the attempt was in flight.
    Crashed,
}

/// One execution attempt of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
}

impl Attempt {
    pub fn started(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ended_at: None,
            outcome: None,
        }
    }
}

/// The durable record of an enqueued task.
///
/// Owned by the store; status and attempts are mutated only through the
/// store's atomic transition operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,
    pub pool: String,
    pub kind: WorkKind,
    /// Name of the action/mutation resolved by the external executor.
    pub handler: String,
    pub payload: ValueRef,
    pub status: WorkStatus,
    pub attempts: Vec<Attempt>,
    /// Earliest time the item is ready for admission.
    pub scheduled_at: DateTime<Utc>,
    pub retry: RetryBehavior,
    /// Name of the completion callback, if one was registered.
    pub on_complete: Option<String>,
    /// Opaque caller context, round-tripped unmodified to the callback.
    pub context: Option<ValueRef>,
    /// Set while Running to request cooperative cancellation; observed
    /// by the runner when the in-flight attempt finishes.
    pub cancel_requested: bool,
    /// Terminal result, set exactly when `status` becomes terminal.
    pub result: Option<TaskResult>,
    /// Store-assigned admission tie-breaker among equal `scheduled_at`.
    pub enqueued_seq: u64,
}

impl WorkItem {
    /// Number of attempts that have finished (successfully or not).
    pub fn completed_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome.is_some())
            .count()
    }

    /// Caller-facing status view. Deliberately does not leak the
    /// terminal value; callers consult the completion callback or fetch
    /// the item explicitly for the result.
    pub fn progress(&self) -> WorkProgress {
        match self.status {
            WorkStatus::Pending => WorkProgress::Pending {
                previous_attempts: self.completed_attempts(),
            },
            WorkStatus::Running => WorkProgress::Running {
                previous_attempts: self.completed_attempts(),
            },
            WorkStatus::Succeeded | WorkStatus::Failed | WorkStatus::Canceled => {
                WorkProgress::Finished
            }
        }
    }
}

/// Caller-facing view of a work item's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkProgress {
    Pending { previous_attempts: usize },
    Running { previous_attempts: usize },
    Finished,
}

/// Configuration of a pool. Immutable after the pool is created for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Cap on concurrently Running items of this pool. Never preempts
    /// work that is already running.
    pub max_parallelism: usize,
    /// Retry behavior applied when the caller does not specify one.
    pub default_retry: RetryBehavior,
    /// Whether actions pick up `default_retry` when enqueued without an
    /// explicit retry option. Mutations are never retried by default.
    pub retry_actions_by_default: bool,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_parallelism: usize) -> Self {
        Self {
            name: name.into(),
            max_parallelism: max_parallelism.max(1),
            default_retry: RetryBehavior::backoff(5, 250, 2.0),
            retry_actions_by_default: false,
        }
    }

    pub fn with_default_retry(mut self, retry: RetryBehavior) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_retry_actions_by_default(mut self, retry_actions_by_default: bool) -> Self {
        self.retry_actions_by_default = retry_actions_by_default;
        self
    }

    /// Retry behavior for an item enqueued without an explicit option.
    pub fn retry_for(&self, kind: WorkKind) -> RetryBehavior {
        match kind {
            WorkKind::Action if self.retry_actions_by_default => self.default_retry.clone(),
            _ => RetryBehavior::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(status: WorkStatus, attempts: Vec<Attempt>) -> WorkItem {
        WorkItem {
            id: WorkId::new(),
            pool: "default".to_string(),
            kind: WorkKind::Action,
            handler: "noop".to_string(),
            payload: ValueRef::new(json!(null)),
            status,
            attempts,
            scheduled_at: Utc::now(),
            retry: RetryBehavior::None,
            on_complete: None,
            context: None,
            cancel_requested: false,
            result: None,
            enqueued_seq: 0,
        }
    }

    #[test]
    fn test_progress_counts_completed_attempts() {
        let now = Utc::now();
        let finished = Attempt {
            started_at: now,
            ended_at: Some(now),
            outcome: Some(AttemptOutcome::Failed {
                error: TaskError::new(1, "nope"),
            }),
        };
        let open = Attempt::started(now);

        let running = item(WorkStatus::Running, vec![finished.clone(), open]);
        assert_eq!(
            running.progress(),
            WorkProgress::Running {
                previous_attempts: 1
            }
        );

        let pending = item(WorkStatus::Pending, vec![finished]);
        assert_eq!(
            pending.progress(),
            WorkProgress::Pending {
                previous_attempts: 1
            }
        );
    }

    #[test]
    fn test_finished_does_not_leak_the_outcome() {
        for status in [
            WorkStatus::Succeeded,
            WorkStatus::Failed,
            WorkStatus::Canceled,
        ] {
            assert_eq!(item(status, Vec::new()).progress(), WorkProgress::Finished);
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_default_retry_only_applies_to_actions_when_enabled() {
        let config = PoolConfig::new("emails", 4).with_retry_actions_by_default(true);
        assert!(matches!(
            config.retry_for(WorkKind::Action),
            RetryBehavior::Backoff { .. }
        ));
        assert_eq!(config.retry_for(WorkKind::Mutation), RetryBehavior::None);

        let no_default = PoolConfig::new("emails", 4);
        assert_eq!(no_default.retry_for(WorkKind::Action), RetryBehavior::None);
    }

    #[test]
    fn test_max_parallelism_floor() {
        assert_eq!(PoolConfig::new("p", 0).max_parallelism, 1);
    }
}
