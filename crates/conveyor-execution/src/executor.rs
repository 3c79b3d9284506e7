use conveyor_core::TaskError;
use conveyor_core::value::ValueRef;
use conveyor_core::work::WorkKind;
use futures::future::BoxFuture;

/// The external collaborator that runs the caller's actions and mutations.
///
/// The engine treats a handler as an opaque, possibly side-effecting call
/// and guarantees *at-least-once* execution per work item: an attempt that
/// dies after partial side effects but before its outcome is recorded will
/// be retried. Handlers must tolerate re-execution with the same logical
/// identity (e.g. an idempotency key carried in the payload).
pub trait TaskExecutor: Send + Sync {
    /// Execute one attempt of the named handler.
    fn execute(
        &self,
        kind: WorkKind,
        handler: &str,
        payload: ValueRef,
    ) -> BoxFuture<'static, Result<ValueRef, TaskError>>;
}
