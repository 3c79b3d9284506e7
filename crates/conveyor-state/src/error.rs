use conveyor_core::work::WorkId;
use conveyor_core::workflow::WorkflowId;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Internal state store error")]
    Internal,

    #[error("Work item not found: {id}")]
    WorkItemNotFound { id: WorkId },

    #[error("Workflow not found: {id}")]
    WorkflowNotFound { id: WorkflowId },

    #[error("Step record not found: workflow {workflow_id}, step {step_index}")]
    StepRecordNotFound {
        workflow_id: WorkflowId,
        step_index: usize,
    },

    #[error("Record is not terminal: {id}")]
    NotTerminal { id: String },

    #[error("Journal append out of order: expected index {expected}, got {actual}")]
    JournalOutOfOrder { expected: usize, actual: usize },

    #[error("No open attempt to finish for work item {id}")]
    NoOpenAttempt { id: WorkId },
}

pub type Result<T, E = error_stack::Report<StateError>> = std::result::Result<T, E>;
