mod error;
mod in_memory;
mod state_store;

pub use error::{Result, StateError};
pub use in_memory::InMemoryStateStore;
pub use state_store::{
    CancelOutcome, DispatchIntent, DispatchSubject, IntentState, StateStore, WorkItemFilters,
    WorkflowFilters,
};
