use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::InputsHash;
use crate::task_result::{ERROR_CODE_INTERNAL, TaskError, TaskResult};
use crate::value::ValueRef;
use crate::work::WorkId;

/// Unique identifier of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a workflow instance's journal.
///
/// Appended when the body issues a step, in issue order; the journal is
/// the sole source of truth on resume. Replay matches regenerated step
/// calls against these records by position and `inputs_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub step_name: String,
    pub inputs_hash: InputsHash,
    /// The work item that carries out this step.
    pub work_id: WorkId,
    /// Terminal result, once observed. A journaled terminal result is
    /// substituted on replay without re-running the underlying handler.
    pub result: Option<TaskResult>,
}

/// The durable record of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    /// Name of the registered definition this instance executes.
    pub definition: String,
    pub args: ValueRef,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal result, set exactly when `status` becomes terminal.
    pub result: Option<TaskResult>,
    pub on_complete: Option<String>,
    pub context: Option<ValueRef>,
}

impl WorkflowInstance {
    /// Caller-facing view of the instance's progress.
    pub fn progress(&self) -> WorkflowProgress {
        match (self.status, &self.result) {
            (WorkflowStatus::InProgress, _) => WorkflowProgress::InProgress,
            (WorkflowStatus::Canceled, _) => WorkflowProgress::Canceled,
            (WorkflowStatus::Completed, Some(TaskResult::Success { value })) => {
                WorkflowProgress::Completed {
                    value: value.clone(),
                }
            }
            (WorkflowStatus::Completed, _) => WorkflowProgress::Completed {
                value: ValueRef::null(),
            },
            (WorkflowStatus::Failed, Some(TaskResult::Error { error })) => {
                WorkflowProgress::Failed {
                    error: error.clone(),
                }
            }
            (WorkflowStatus::Failed, _) => WorkflowProgress::Failed {
                error: TaskError::new(ERROR_CODE_INTERNAL, "workflow failed"),
            },
        }
    }
}

/// Caller-facing view of a workflow instance's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkflowProgress {
    InProgress,
    Completed { value: ValueRef },
    Failed { error: TaskError },
    Canceled,
}
