use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::Utc;
use conveyor_core::hash::InputsHash;
use conveyor_core::retry::RetryBehavior;
use conveyor_core::value::{MAX_PAYLOAD_BYTES, ValueRef};
use conveyor_core::work::{WorkId, WorkItem, WorkKind, WorkStatus};
use conveyor_core::workflow::{StepRecord, WorkflowId, WorkflowInstance, WorkflowStatus};
use conveyor_core::{
    ERROR_CODE_INTERNAL, ERROR_CODE_NONDETERMINISM, ERROR_CODE_SIZE_LIMIT, TaskError, TaskResult,
};
use conveyor_state::DispatchSubject;
use error_stack::ResultExt as _;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{Instrument as _, info_span};

use crate::engine::{EngineShared, cancel_work};
use crate::error::{EngineError, Result};
use crate::scheduler::{PoolScheduler, after_millis};

/// Error observed by a workflow body when awaiting a step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step failed: {0}")]
    Failed(TaskError),
    #[error("workflow canceled")]
    Canceled,
    #[error("replay diverged from the journal at step {index} ({step})")]
    NondeterministicReplay { index: usize, step: String },
    #[error("step payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("internal engine error")]
    Internal,
}

impl From<TaskError> for StepError {
    fn from(error: TaskError) -> Self {
        StepError::Failed(error)
    }
}

/// Per-step overrides. The defaults run the step immediately with the
/// workflow pool's retry behavior for its kind.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Delay before the step becomes ready for admission.
    pub run_after: Option<std::time::Duration>,
    /// Retry behavior override for this step's work item.
    pub retry: Option<RetryBehavior>,
}

/// A registered workflow body.
///
/// Bodies must be deterministic with respect to the journal: given the
/// same arguments and the same recorded step results, a body must issue
/// the same steps, with the same names and payloads, in the same order.
/// All interaction with the outside world goes through
/// [`WorkflowContext::step`]; anything else (clocks, randomness, I/O)
/// will diverge on replay.
pub trait WorkflowDefinition: Send + Sync {
    /// Stable name the definition is registered and journaled under.
    fn name(&self) -> &str;

    fn run(&self, ctx: WorkflowContext, args: ValueRef)
    -> BoxFuture<'static, std::result::Result<ValueRef, StepError>>;
}

struct JournalCursor {
    /// Journal loaded at resume time, in step index order.
    prior: Vec<StepRecord>,
    next_index: usize,
}

struct ContextInner {
    workflow_id: WorkflowId,
    shared: Arc<EngineShared>,
    pool: Arc<PoolScheduler>,
    cursor: Mutex<JournalCursor>,
}

/// Handle a workflow body uses to issue steps and observe their results.
///
/// Issuing a step journals it and enqueues a work item; awaiting the
/// returned [`StepHandle`] journals the result. Steps issued before any
/// handle is awaited run in parallel on the workflow pool.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub fn workflow_id(&self) -> WorkflowId {
        self.inner.workflow_id
    }

    pub async fn run_action(
        &self,
        name: &str,
        payload: ValueRef,
    ) -> std::result::Result<StepHandle, StepError> {
        self.step(WorkKind::Action, name, payload, StepOptions::default())
            .await
    }

    pub async fn run_mutation(
        &self,
        name: &str,
        payload: ValueRef,
    ) -> std::result::Result<StepHandle, StepError> {
        self.step(WorkKind::Mutation, name, payload, StepOptions::default())
            .await
    }

    /// Issue one step: on first execution this journals the call and
    /// enqueues a work item; on replay it is matched against the journal
    /// by position and inputs hash, and a recorded terminal result is
    /// substituted without re-running the handler.
    pub async fn step(
        &self,
        kind: WorkKind,
        name: &str,
        payload: ValueRef,
        options: StepOptions,
    ) -> std::result::Result<StepHandle, StepError> {
        let workflow_id = self.inner.workflow_id;
        let state = &self.inner.shared.state;

        // A canceled (or otherwise finished) instance stops issuing new
        // steps at the next step boundary.
        let instance = state
            .get_workflow(workflow_id)
            .await
            .map_err(internal("failed to load workflow instance"))?
            .ok_or(StepError::Internal)?;
        if instance.status != WorkflowStatus::InProgress {
            return Err(StepError::Canceled);
        }

        let size = payload.serialized_size().map_err(|_| StepError::Internal)?;
        if size > MAX_PAYLOAD_BYTES {
            return Err(StepError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let inputs_hash = InputsHash::from_step(name, &payload)
            .map_err(internal("failed to hash step inputs"))?;

        let (index, prior) = {
            let mut cursor = self.inner.cursor.lock().unwrap_or_else(|e| e.into_inner());
            let index = cursor.next_index;
            cursor.next_index += 1;
            (index, cursor.prior.get(index).cloned())
        };

        match prior {
            Some(record) => {
                if record.step_name != name || record.inputs_hash != inputs_hash {
                    return Err(StepError::NondeterministicReplay {
                        index,
                        step: name.to_string(),
                    });
                }
                if let Some(result) = record.result.clone() {
                    // Already observed; substitute without re-running.
                    return Ok(StepHandle::ready(result_to_step(result)));
                }
                self.reattach(index, record, kind, payload, &options).await
            }
            None => {
                let work_id = WorkId::new();
                let item = self.build_item(work_id, kind, name, payload, &options);
                let record = StepRecord {
                    step_index: index,
                    step_name: name.to_string(),
                    inputs_hash,
                    work_id,
                    result: None,
                };
                // Journal before enqueueing: a crash in between leaves a
                // record without an item, which resume re-creates.
                state
                    .append_step_record(workflow_id, record)
                    .await
                    .map_err(internal("failed to journal step"))?;
                let rx = self.inner.shared.hub.subscribe(work_id);
                self.inner
                    .pool
                    .submit(item)
                    .await
                    .map_err(internal("failed to enqueue step work item"))?;
                Ok(self.awaiting(index, work_id, rx))
            }
        }
    }

    /// Resume a journaled step whose result was never recorded.
    async fn reattach(
        &self,
        index: usize,
        record: StepRecord,
        kind: WorkKind,
        payload: ValueRef,
        options: &StepOptions,
    ) -> std::result::Result<StepHandle, StepError> {
        let state = &self.inner.shared.state;
        let rx = self.inner.shared.hub.subscribe(record.work_id);
        let item = state
            .get_work_item(record.work_id)
            .await
            .map_err(internal("failed to load step work item"))?;
        match item {
            Some(item) if item.status.is_terminal() => {
                let result = item.result.ok_or(StepError::Internal)?;
                state
                    .record_step_result(self.inner.workflow_id, index, result.clone())
                    .await
                    .map_err(internal("failed to journal step result"))?;
                Ok(StepHandle::ready(result_to_step(result)))
            }
            Some(_) => {
                self.inner.pool.wake();
                Ok(self.awaiting(index, record.work_id, rx))
            }
            None => {
                // Crashed after journaling the step but before persisting
                // its work item. The body regenerates the same payload on
                // replay, so re-create the item under the journaled id.
                tracing::warn!(
                    work_id = %record.work_id,
                    step = %record.step_name,
                    "journaled step has no work item, re-creating it"
                );
                let item = self.build_item(record.work_id, kind, &record.step_name, payload, options);
                self.inner
                    .pool
                    .submit(item)
                    .await
                    .map_err(internal("failed to re-enqueue step work item"))?;
                Ok(self.awaiting(index, record.work_id, rx))
            }
        }
    }

    fn build_item(
        &self,
        id: WorkId,
        kind: WorkKind,
        name: &str,
        payload: ValueRef,
        options: &StepOptions,
    ) -> WorkItem {
        let config = self.inner.pool.config();
        let now = Utc::now();
        let scheduled_at = match options.run_after {
            Some(delay) => after_millis(now, delay.as_millis().min(u64::MAX as u128) as u64),
            None => now,
        };
        WorkItem {
            id,
            pool: config.name.clone(),
            kind,
            handler: name.to_string(),
            payload,
            status: WorkStatus::Pending,
            attempts: Vec::new(),
            scheduled_at,
            retry: options
                .retry
                .clone()
                .unwrap_or_else(|| config.retry_for(kind)),
            on_complete: None,
            context: None,
            cancel_requested: false,
            result: None,
            enqueued_seq: 0,
        }
    }

    fn awaiting(&self, index: usize, work_id: WorkId, rx: oneshot::Receiver<TaskResult>) -> StepHandle {
        let state = self.inner.shared.state.clone();
        let workflow_id = self.inner.workflow_id;
        StepHandle::new(async move {
            let result = match rx.await {
                Ok(result) => result,
                // The hub sender was dropped (shutdown race); the durable
                // record decides.
                Err(_) => match state.get_work_item(work_id).await {
                    Ok(Some(item)) if item.status.is_terminal() => {
                        item.result.ok_or(StepError::Internal)?
                    }
                    _ => return Err(StepError::Internal),
                },
            };
            state
                .record_step_result(workflow_id, index, result.clone())
                .await
                .map_err(internal("failed to journal step result"))?;
            result_to_step(result)
        })
    }
}

fn internal<E: std::fmt::Debug>(message: &'static str) -> impl FnOnce(E) -> StepError {
    move |error| {
        tracing::error!(?error, "{message}");
        StepError::Internal
    }
}

fn result_to_step(result: TaskResult) -> std::result::Result<ValueRef, StepError> {
    match result {
        TaskResult::Success { value } => Ok(value),
        TaskResult::Error { error } => Err(StepError::Failed(error)),
        TaskResult::Canceled => Err(StepError::Canceled),
    }
}

/// The pending result of an issued step.
///
/// Awaiting it yields the step's value and journals the observed result.
/// Dropping it leaves the step running; its result is still journaled by
/// a later awaiter or on replay.
pub struct StepHandle {
    fut: BoxFuture<'static, std::result::Result<ValueRef, StepError>>,
}

impl StepHandle {
    fn new(
        fut: impl Future<Output = std::result::Result<ValueRef, StepError>> + Send + 'static,
    ) -> Self {
        Self { fut: fut.boxed() }
    }

    fn ready(result: std::result::Result<ValueRef, StepError>) -> Self {
        Self::new(async move { result })
    }
}

impl Future for StepHandle {
    type Output = std::result::Result<ValueRef, StepError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().fut.as_mut().poll(cx)
    }
}

/// Drive one workflow instance to a terminal status.
///
/// Loads the journal, runs the body (replaying any prefix), records the
/// terminal result first-writer-wins, cancels outstanding step items, and
/// dispatches the completion callback.
pub(crate) async fn drive_instance(
    shared: Arc<EngineShared>,
    pool: Arc<PoolScheduler>,
    definition: Arc<dyn WorkflowDefinition>,
    instance: WorkflowInstance,
) {
    let workflow_id = instance.id;
    let span = info_span!("workflow", %workflow_id, definition = %instance.definition);
    async move {
        let prior = match shared.state.list_step_records(workflow_id).await {
            Ok(prior) => prior,
            Err(error) => {
                tracing::error!(?error, "failed to load workflow journal");
                return;
            }
        };
        if !prior.is_empty() {
            tracing::info!(journaled_steps = prior.len(), "resuming workflow from journal");
        }

        let ctx = WorkflowContext {
            inner: Arc::new(ContextInner {
                workflow_id,
                shared: shared.clone(),
                pool,
                cursor: Mutex::new(JournalCursor {
                    prior,
                    next_index: 0,
                }),
            }),
        };

        let outcome = definition.run(ctx, instance.args.clone()).await;
        let (status, result) = match outcome {
            Ok(value) => (WorkflowStatus::Completed, TaskResult::Success { value }),
            Err(StepError::Canceled) => (WorkflowStatus::Canceled, TaskResult::Canceled),
            Err(StepError::Failed(error)) => {
                (WorkflowStatus::Failed, TaskResult::Error { error })
            }
            Err(error @ StepError::NondeterministicReplay { .. }) => {
                tracing::error!("determinism violation: {error}");
                (
                    WorkflowStatus::Failed,
                    TaskResult::Error {
                        error: TaskError::new(ERROR_CODE_NONDETERMINISM, error.to_string()),
                    },
                )
            }
            Err(error @ StepError::PayloadTooLarge { .. }) => (
                WorkflowStatus::Failed,
                TaskResult::Error {
                    error: TaskError::new(ERROR_CODE_SIZE_LIMIT, error.to_string()),
                },
            ),
            Err(StepError::Internal) => (
                WorkflowStatus::Failed,
                TaskResult::Error {
                    error: TaskError::new(ERROR_CODE_INTERNAL, "internal engine error"),
                },
            ),
        };

        // First terminal writer wins; a concurrent cancel may have
        // finished the instance already.
        let finished = match shared.state.finish_workflow(workflow_id, status, result).await {
            Ok(finished) => finished,
            Err(error) => {
                tracing::error!(?error, "failed to record workflow result");
                return;
            }
        };

        if let Err(error) = cancel_outstanding_steps(&shared, workflow_id).await {
            tracing::error!(?error, "failed to cancel outstanding steps");
        }

        tracing::info!(status = %finished.status, "workflow finished");
        if let Some(result) = &finished.result {
            if let Err(error) = shared
                .dispatcher
                .dispatch(
                    DispatchSubject::Workflow(workflow_id),
                    finished.on_complete.as_deref(),
                    result,
                    finished.context.as_ref(),
                )
                .await
            {
                tracing::error!(?error, "workflow completion dispatch failed");
            }
        }
    }
    .instrument(span)
    .await
}

/// Request cancellation of every journaled step without a recorded result.
pub(crate) async fn cancel_outstanding_steps(
    shared: &Arc<EngineShared>,
    workflow_id: WorkflowId,
) -> Result<()> {
    let records = shared
        .state
        .list_step_records(workflow_id)
        .await
        .change_context(EngineError::State)?;
    for record in records {
        if record.result.is_some() {
            continue;
        }
        match cancel_work(shared, record.work_id).await {
            Ok(()) => {}
            // A journaled step may have no item if the process died
            // between journaling and enqueueing.
            Err(error)
                if matches!(error.current_context(), EngineError::WorkItemNotFound { .. }) => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}
