use conveyor_core::work::WorkId;
use conveyor_core::workflow::WorkflowId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pool not found: {name}")]
    PoolNotFound { name: String },
    #[error("pool already exists: {name}")]
    PoolAlreadyExists { name: String },
    #[error("workflow definition not registered: {name}")]
    DefinitionNotFound { name: String },
    #[error("work item not found: {id}")]
    WorkItemNotFound { id: WorkId },
    #[error("workflow not found: {id}")]
    WorkflowNotFound { id: WorkflowId },
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("record is not terminal")]
    NotTerminal,
    #[error("state store error")]
    State,
    #[error("internal engine error")]
    Internal,
}

pub type Result<T, E = error_stack::Report<EngineError>> = std::result::Result<T, E>;
