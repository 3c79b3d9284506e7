use std::borrow::Cow;

use crate::value::ValueRef;

/// Internal engine fault (store inconsistency, executor panic plumbing).
pub const ERROR_CODE_INTERNAL: i64 = 500;
/// Replay of a workflow body diverged from its journal.
pub const ERROR_CODE_NONDETERMINISM: i64 = 409;
/// A payload or result exceeded [`crate::value::MAX_PAYLOAD_BYTES`].
pub const ERROR_CODE_SIZE_LIMIT: i64 = 413;
/// An attempt was interrupted by a process restart.
pub const ERROR_CODE_CRASHED: i64 = 503;

/// An error reported from a task attempt or a workflow body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TaskError {
    pub code: i64,
    pub message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ValueRef>,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error({}): {}", self.code, self.message)
    }
}

impl TaskError {
    pub fn new(code: i64, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data<D: serde::Serialize>(self, data: D) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_value(data)?.into();
        Ok(Self {
            data: Some(data),
            ..self
        })
    }
}

/// The terminal outcome of a work item or a workflow instance.
///
/// Immutable once produced; this is the value handed to completion
/// callbacks and recorded in the journal.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskResult {
    /// The task finished and produced a value.
    Success { value: ValueRef },
    /// The task failed terminally (retries, if any, are exhausted).
    Error { error: TaskError },
    /// The task was canceled before reaching its own outcome.
    Canceled,
}

impl From<serde_json::Value> for TaskResult {
    fn from(value: serde_json::Value) -> Self {
        Self::Success {
            value: ValueRef::new(value),
        }
    }
}

impl TaskResult {
    pub fn success(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success { value } => Some(value.as_ref()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }

    pub fn canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
