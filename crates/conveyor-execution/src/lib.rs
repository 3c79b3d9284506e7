mod dispatch;
mod engine;
mod error;
mod executor;
mod hub;
mod scheduler;
mod workflow;

pub mod testing;

pub use dispatch::{CallbackError, CompletionCallback, DispatchError, Dispatcher};
pub use engine::{Engine, EngineConfig, EnqueueOptions, StartOptions};
pub use error::{EngineError, Result};
pub use executor::TaskExecutor;
pub use scheduler::PoolScheduler;
pub use workflow::{StepError, StepHandle, StepOptions, WorkflowContext, WorkflowDefinition};
