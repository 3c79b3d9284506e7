use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use conveyor_core::retry::{self, RetryDecision};
use conveyor_core::value::MAX_PAYLOAD_BYTES;
use conveyor_core::work::{AttemptOutcome, PoolConfig, WorkItem, WorkStatus};
use conveyor_core::{ERROR_CODE_INTERNAL, ERROR_CODE_SIZE_LIMIT, TaskError};
use conveyor_state::{DispatchSubject, StateStore};
use error_stack::{ResultExt as _, ensure};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt as _, StreamExt as _};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, info_span};

use crate::dispatch::Dispatcher;
use crate::error::{EngineError, Result};
use crate::executor::TaskExecutor;
use crate::hub::CompletionHub;

/// One pool: a bounded admission loop over a FIFO backlog of work items.
///
/// The loop is the only claimer for its pool, so the parallelism bound is
/// enforced by construction: it claims while fewer than `max_parallelism`
/// attempts are in flight, then sleeps until an attempt finishes, a new
/// item arrives, or the next scheduled time passes.
pub struct PoolScheduler {
    config: PoolConfig,
    state: Arc<dyn StateStore>,
    executor: Arc<dyn TaskExecutor>,
    dispatcher: Arc<Dispatcher>,
    hub: CompletionHub,
    wake: Notify,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolScheduler {
    pub(crate) fn spawn(
        config: PoolConfig,
        state: Arc<dyn StateStore>,
        executor: Arc<dyn TaskExecutor>,
        dispatcher: Arc<Dispatcher>,
        hub: CompletionHub,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            config,
            state,
            executor,
            dispatcher,
            hub,
            wake: Notify::new(),
            loop_handle: Mutex::new(None),
        });
        let span = info_span!("pool", name = %scheduler.config.name);
        let handle = tokio::spawn(admission_loop(scheduler.clone()).instrument(span));
        *scheduler
            .loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        scheduler
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Abort the admission loop along with every in-flight attempt future.
    /// Interrupted attempts stay `Running` in the store until recovery.
    pub(crate) fn shutdown(&self) {
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Persist a new pending item and wake the admission loop.
    pub(crate) async fn submit(&self, item: WorkItem) -> Result<WorkItem> {
        let size = item
            .payload
            .serialized_size()
            .change_context(EngineError::Internal)?;
        ensure!(
            size <= MAX_PAYLOAD_BYTES,
            EngineError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES
            }
        );
        if let Some(context) = &item.context {
            let size = context
                .serialized_size()
                .change_context(EngineError::Internal)?;
            ensure!(
                size <= MAX_PAYLOAD_BYTES,
                EngineError::PayloadTooLarge {
                    size,
                    limit: MAX_PAYLOAD_BYTES
                }
            );
        }

        let stored = self
            .state
            .create_work_item(item)
            .await
            .change_context(EngineError::State)?;
        tracing::debug!(work_id = %stored.id, pool = %stored.pool, handler = %stored.handler, "enqueued work item");
        self.wake.notify_one();
        Ok(stored)
    }
}

async fn admission_loop(scheduler: Arc<PoolScheduler>) {
    let max_parallelism = scheduler.config.max_parallelism;
    let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

    loop {
        while running.len() < max_parallelism {
            match scheduler
                .state
                .claim_next_ready(&scheduler.config.name, Utc::now())
                .await
            {
                Ok(Some(item)) => {
                    tracing::debug!(
                        work_id = %item.id,
                        attempt = item.attempts.len(),
                        "admitting work item"
                    );
                    running.push(run_attempt(scheduler.clone(), item).boxed());
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(?error, "failed to claim next ready item");
                    break;
                }
            }
        }

        let deadline = match scheduler.state.next_scheduled_at(&scheduler.config.name).await {
            Ok(deadline) => deadline,
            Err(error) => {
                tracing::error!(?error, "failed to read next scheduled time");
                None
            }
        };
        let has_capacity = running.len() < max_parallelism;

        tokio::select! {
            _ = scheduler.wake.notified() => {}
            Some(()) = running.next(), if !running.is_empty() => {}
            _ = sleep_until(deadline), if has_capacity && deadline.is_some() => {}
        }
    }
}

async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    let Some(deadline) = deadline else {
        return futures::future::pending().await;
    };
    let delay = (deadline - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);
    tokio::time::sleep(delay).await;
}

/// Run one attempt to completion and record its outcome.
async fn run_attempt(scheduler: Arc<PoolScheduler>, item: WorkItem) {
    let span = info_span!(
        "attempt",
        work_id = %item.id,
        handler = %item.handler,
        attempt = item.attempts.len(),
    );
    async move {
        let execution = scheduler
            .executor
            .execute(item.kind, &item.handler, item.payload.clone());
        // Spawned so a panicking handler is contained and surfaces as an
        // ordinary failed attempt instead of taking the pool down.
        let outcome = match tokio::spawn(execution).await {
            Ok(Ok(value)) => match value.serialized_size() {
                Ok(size) if size > MAX_PAYLOAD_BYTES => AttemptOutcome::Failed {
                    error: TaskError::new(
                        ERROR_CODE_SIZE_LIMIT,
                        format!("result of {size} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit"),
                    ),
                },
                _ => AttemptOutcome::Succeeded { value },
            },
            Ok(Err(error)) => AttemptOutcome::Failed { error },
            Err(join_error) => AttemptOutcome::Failed {
                error: TaskError::new(
                    ERROR_CODE_INTERNAL,
                    format!("handler panicked: {join_error}"),
                ),
            },
        };

        // An oversized result is terminal regardless of the retry policy;
        // re-running would produce another oversized result.
        let retry_at = match &outcome {
            AttemptOutcome::Failed { error } if error.code != ERROR_CODE_SIZE_LIMIT => {
                let attempts_so_far = item.completed_attempts() as u32 + 1;
                match retry::decide(attempts_so_far, &item.retry) {
                    RetryDecision::Retry { delay_ms } => Some(after_millis(Utc::now(), delay_ms)),
                    RetryDecision::GiveUp => None,
                }
            }
            _ => None,
        };

        match scheduler
            .state
            .finish_attempt(item.id, Utc::now(), outcome, retry_at)
            .await
        {
            Ok(updated) => match updated.status {
                WorkStatus::Pending => {
                    tracing::debug!(scheduled_at = %updated.scheduled_at, "attempt failed, retry scheduled");
                }
                status => {
                    tracing::debug!(%status, "work item finished");
                    if let Some(result) = &updated.result {
                        scheduler.hub.complete(updated.id, result);
                        if let Err(error) = scheduler
                            .dispatcher
                            .dispatch(
                                DispatchSubject::Work(updated.id),
                                updated.on_complete.as_deref(),
                                result,
                                updated.context.as_ref(),
                            )
                            .await
                        {
                            tracing::error!(?error, work_id = %updated.id, "completion dispatch failed");
                        }
                    }
                }
            },
            Err(error) => {
                tracing::error!(?error, work_id = %item.id, "failed to record attempt outcome");
            }
        }
    }
    .instrument(span)
    .await
}

/// `now` plus a delay, clamped to the representable range. Saturated
/// retry delays and far-future `run_after` values land on `MAX_UTC`
/// rather than overflowing.
pub(crate) fn after_millis(now: DateTime<Utc>, delay_ms: u64) -> DateTime<Utc> {
    let delay = chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64);
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
