use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt as _};
use tokio::sync::RwLock;

use conveyor_core::{ERROR_CODE_CRASHED, TaskError, TaskResult};
use conveyor_core::work::{AttemptOutcome, WorkId, WorkItem, WorkStatus};
use conveyor_core::workflow::{StepRecord, WorkflowId, WorkflowInstance, WorkflowStatus};

use crate::state_store::{
    CancelOutcome, DispatchIntent, DispatchSubject, IntentState, WorkItemFilters, WorkflowFilters,
};
use crate::{StateError, StateStore};

/// In-memory implementation of [`StateStore`].
///
/// Suitable for single-process engines and tests. Atomicity per record
/// is provided by holding the relevant write lock across each
/// read-modify-write; a persistent backend would use per-record
/// compare-and-set instead.
pub struct InMemoryStateStore {
    work_items: Arc<RwLock<HashMap<WorkId, WorkItem>>>,
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowInstance>>>,
    journals: Arc<RwLock<HashMap<WorkflowId, Vec<StepRecord>>>>,
    intents: Arc<RwLock<HashMap<DispatchSubject, DispatchIntent>>>,
    enqueue_seq: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            work_items: Arc::new(RwLock::new(HashMap::new())),
            workflows: Arc::new(RwLock::new(HashMap::new())),
            journals: Arc::new(RwLock::new(HashMap::new())),
            intents: Arc::new(RwLock::new(HashMap::new())),
            enqueue_seq: AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStateStore {
    fn create_work_item(
        &self,
        mut item: WorkItem,
    ) -> BoxFuture<'_, error_stack::Result<WorkItem, StateError>> {
        let work_items = self.work_items.clone();
        item.enqueued_seq = self.enqueue_seq.fetch_add(1, Ordering::Relaxed);

        async move {
            let mut work_items = work_items.write().await;
            work_items.insert(item.id, item.clone());
            Ok(item)
        }
        .boxed()
    }

    fn get_work_item(
        &self,
        id: WorkId,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkItem>, StateError>> {
        let work_items = self.work_items.clone();

        async move {
            let work_items = work_items.read().await;
            Ok(work_items.get(&id).cloned())
        }
        .boxed()
    }

    fn claim_next_ready(
        &self,
        pool: &str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkItem>, StateError>> {
        let work_items = self.work_items.clone();
        let pool = pool.to_string();

        async move {
            let mut work_items = work_items.write().await;

            let next = work_items
                .values()
                .filter(|item| {
                    item.pool == pool
                        && item.status == WorkStatus::Pending
                        && item.scheduled_at <= now
                })
                .min_by_key(|item| (item.scheduled_at, item.enqueued_seq))
                .map(|item| item.id);

            let Some(id) = next else {
                return Ok(None);
            };

            let item = work_items
                .get_mut(&id)
                .ok_or_else(|| error_stack::report!(StateError::WorkItemNotFound { id }))?;
            item.status = WorkStatus::Running;
            item.attempts
                .push(conveyor_core::work::Attempt::started(now));

            Ok(Some(item.clone()))
        }
        .boxed()
    }

    fn next_scheduled_at(
        &self,
        pool: &str,
    ) -> BoxFuture<'_, error_stack::Result<Option<DateTime<Utc>>, StateError>> {
        let work_items = self.work_items.clone();
        let pool = pool.to_string();

        async move {
            let work_items = work_items.read().await;
            Ok(work_items
                .values()
                .filter(|item| item.pool == pool && item.status == WorkStatus::Pending)
                .map(|item| item.scheduled_at)
                .min())
        }
        .boxed()
    }

    fn finish_attempt(
        &self,
        id: WorkId,
        ended_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        retry_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, error_stack::Result<WorkItem, StateError>> {
        let work_items = self.work_items.clone();

        async move {
            let mut work_items = work_items.write().await;
            let item = work_items
                .get_mut(&id)
                .ok_or_else(|| error_stack::report!(StateError::WorkItemNotFound { id }))?;

            let attempt = item
                .attempts
                .iter_mut()
                .rev()
                .find(|attempt| attempt.outcome.is_none())
                .ok_or_else(|| error_stack::report!(StateError::NoOpenAttempt { id }))?;
            attempt.ended_at = Some(ended_at);
            attempt.outcome = Some(outcome.clone());

            if item.cancel_requested {
                // Cancellation overrides the attempt's own outcome and
                // suppresses any further retries.
                item.status = WorkStatus::Canceled;
                item.result = Some(TaskResult::Canceled);
            } else {
                match outcome {
                    AttemptOutcome::Succeeded { value } => {
                        item.status = WorkStatus::Succeeded;
                        item.result = Some(TaskResult::Success { value });
                    }
                    AttemptOutcome::Failed { error } => match retry_at {
                        Some(at) => {
                            item.status = WorkStatus::Pending;
                            item.scheduled_at = at;
                        }
                        None => {
                            item.status = WorkStatus::Failed;
                            item.result = Some(TaskResult::Error { error });
                        }
                    },
                    AttemptOutcome::Crashed => match retry_at {
                        Some(at) => {
                            item.status = WorkStatus::Pending;
                            item.scheduled_at = at;
                        }
                        None => {
                            item.status = WorkStatus::Failed;
                            item.result = Some(TaskResult::Error {
                                error: TaskError::new(
                                    ERROR_CODE_CRASHED,
                                    "attempt interrupted by process restart",
                                ),
                            });
                        }
                    },
                }
            }

            Ok(item.clone())
        }
        .boxed()
    }

    fn request_cancel(
        &self,
        id: WorkId,
    ) -> BoxFuture<'_, error_stack::Result<CancelOutcome, StateError>> {
        let work_items = self.work_items.clone();

        async move {
            let mut work_items = work_items.write().await;
            let item = work_items
                .get_mut(&id)
                .ok_or_else(|| error_stack::report!(StateError::WorkItemNotFound { id }))?;

            match item.status {
                WorkStatus::Pending => {
                    item.status = WorkStatus::Canceled;
                    item.result = Some(TaskResult::Canceled);
                    Ok(CancelOutcome::CanceledPending(item.clone()))
                }
                WorkStatus::Running => {
                    item.cancel_requested = true;
                    Ok(CancelOutcome::FlagSet)
                }
                _ => Ok(CancelOutcome::AlreadyTerminal),
            }
        }
        .boxed()
    }

    fn list_work_items(
        &self,
        filters: &WorkItemFilters,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkItem>, StateError>> {
        let work_items = self.work_items.clone();
        let filters = filters.clone();

        async move {
            let work_items = work_items.read().await;
            let mut results: Vec<WorkItem> = work_items
                .values()
                .filter(|item| {
                    if let Some(ref pool) = filters.pool {
                        if &item.pool != pool {
                            return false;
                        }
                    }
                    if let Some(status) = filters.status {
                        if item.status != status {
                            return false;
                        }
                    }
                    true
                })
                .cloned()
                .collect();

            results.sort_by_key(|item| item.enqueued_seq);
            if let Some(limit) = filters.limit {
                results.truncate(limit);
            }

            Ok(results)
        }
        .boxed()
    }

    fn remove_work_item(
        &self,
        id: WorkId,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let work_items = self.work_items.clone();

        async move {
            let mut work_items = work_items.write().await;
            let item = work_items
                .get(&id)
                .ok_or_else(|| error_stack::report!(StateError::WorkItemNotFound { id }))?;

            error_stack::ensure!(
                item.status.is_terminal(),
                StateError::NotTerminal { id: id.to_string() }
            );

            work_items.remove(&id);
            Ok(())
        }
        .boxed()
    }

    fn create_workflow(
        &self,
        instance: WorkflowInstance,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let workflows = self.workflows.clone();

        async move {
            let mut workflows = workflows.write().await;
            workflows.insert(instance.id, instance);
            Ok(())
        }
        .boxed()
    }

    fn get_workflow(
        &self,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkflowInstance>, StateError>> {
        let workflows = self.workflows.clone();

        async move {
            let workflows = workflows.read().await;
            Ok(workflows.get(&id).cloned())
        }
        .boxed()
    }

    fn finish_workflow(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        result: TaskResult,
    ) -> BoxFuture<'_, error_stack::Result<WorkflowInstance, StateError>> {
        let workflows = self.workflows.clone();

        async move {
            let mut workflows = workflows.write().await;
            let instance = workflows
                .get_mut(&id)
                .ok_or_else(|| error_stack::report!(StateError::WorkflowNotFound { id }))?;

            // First terminal transition wins.
            if !instance.status.is_terminal() && status.is_terminal() {
                instance.status = status;
                instance.result = Some(result);
                instance.completed_at = Some(Utc::now());
            }

            Ok(instance.clone())
        }
        .boxed()
    }

    fn list_workflows(
        &self,
        filters: &WorkflowFilters,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowInstance>, StateError>> {
        let workflows = self.workflows.clone();
        let filters = filters.clone();

        async move {
            let workflows = workflows.read().await;
            let mut results: Vec<WorkflowInstance> = workflows
                .values()
                .filter(|instance| {
                    if let Some(status) = filters.status {
                        if instance.status != status {
                            return false;
                        }
                    }
                    if let Some(ref definition) = filters.definition {
                        if &instance.definition != definition {
                            return false;
                        }
                    }
                    true
                })
                .cloned()
                .collect();

            results.sort_by_key(|instance| instance.started_at);
            Ok(results)
        }
        .boxed()
    }

    fn remove_workflow(
        &self,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let workflows = self.workflows.clone();
        let journals = self.journals.clone();

        async move {
            let mut workflows = workflows.write().await;
            let instance = workflows
                .get(&id)
                .ok_or_else(|| error_stack::report!(StateError::WorkflowNotFound { id }))?;

            error_stack::ensure!(
                instance.status.is_terminal(),
                StateError::NotTerminal { id: id.to_string() }
            );

            workflows.remove(&id);
            let mut journals = journals.write().await;
            journals.remove(&id);
            Ok(())
        }
        .boxed()
    }

    fn append_step_record(
        &self,
        workflow_id: WorkflowId,
        record: StepRecord,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let journals = self.journals.clone();

        async move {
            let mut journals = journals.write().await;
            let journal = journals.entry(workflow_id).or_default();

            error_stack::ensure!(
                record.step_index == journal.len(),
                StateError::JournalOutOfOrder {
                    expected: journal.len(),
                    actual: record.step_index,
                }
            );

            journal.push(record);
            Ok(())
        }
        .boxed()
    }

    fn record_step_result(
        &self,
        workflow_id: WorkflowId,
        step_index: usize,
        result: TaskResult,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let journals = self.journals.clone();

        async move {
            let mut journals = journals.write().await;
            let record = journals
                .get_mut(&workflow_id)
                .and_then(|journal| journal.get_mut(step_index))
                .ok_or_else(|| {
                    error_stack::report!(StateError::StepRecordNotFound {
                        workflow_id,
                        step_index,
                    })
                })?;

            record.result = Some(result);
            Ok(())
        }
        .boxed()
    }

    fn list_step_records(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Vec<StepRecord>, StateError>> {
        let journals = self.journals.clone();

        async move {
            let journals = journals.read().await;
            Ok(journals.get(&workflow_id).cloned().unwrap_or_default())
        }
        .boxed()
    }

    fn record_dispatch_intent(
        &self,
        intent: DispatchIntent,
    ) -> BoxFuture<'_, error_stack::Result<IntentState, StateError>> {
        let intents = self.intents.clone();

        async move {
            let mut intents = intents.write().await;
            match intents.get(&intent.subject) {
                Some(existing) if existing.resolved_at.is_some() => {
                    Ok(IntentState::AlreadyResolved)
                }
                Some(_) => Ok(IntentState::PendingRedelivery),
                None => {
                    intents.insert(intent.subject, intent);
                    Ok(IntentState::Recorded)
                }
            }
        }
        .boxed()
    }

    fn resolve_dispatch_intent(
        &self,
        subject: DispatchSubject,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let intents = self.intents.clone();

        async move {
            let mut intents = intents.write().await;
            if let Some(intent) = intents.get_mut(&subject) {
                intent.resolved_at = Some(Utc::now());
            }
            Ok(())
        }
        .boxed()
    }

    fn list_unresolved_intents(
        &self,
    ) -> BoxFuture<'_, error_stack::Result<Vec<DispatchIntent>, StateError>> {
        let intents = self.intents.clone();

        async move {
            let intents = intents.read().await;
            let mut results: Vec<DispatchIntent> = intents
                .values()
                .filter(|intent| intent.resolved_at.is_none())
                .cloned()
                .collect();
            results.sort_by_key(|intent| intent.recorded_at);
            Ok(results)
        }
        .boxed()
    }
}
