use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use conveyor_core::retry::{self, RetryBehavior, RetryDecision};
use conveyor_core::value::{MAX_PAYLOAD_BYTES, ValueRef};
use conveyor_core::work::{
    AttemptOutcome, PoolConfig, WorkId, WorkItem, WorkKind, WorkProgress, WorkStatus,
};
use conveyor_core::workflow::{WorkflowId, WorkflowInstance, WorkflowProgress, WorkflowStatus};
use conveyor_core::{ERROR_CODE_INTERNAL, TaskError, TaskResult};
use conveyor_state::{
    CancelOutcome, DispatchSubject, StateError, StateStore, WorkItemFilters, WorkflowFilters,
};
use error_stack::{Report, ResultExt as _, ensure};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::dispatch::{CompletionCallback, Dispatcher};
use crate::error::{EngineError, Result};
use crate::executor::TaskExecutor;
use crate::hub::CompletionHub;
use crate::scheduler::{PoolScheduler, after_millis};
use crate::workflow::{self, WorkflowDefinition};

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The internal pool workflow steps run on.
    pub workflow_pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_pool: PoolConfig::new("workflows", 16),
        }
    }
}

/// Options for [`Engine::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay before the item becomes ready for admission.
    pub run_after: Option<std::time::Duration>,
    /// Retry behavior; defaults to the pool's policy for the item's kind.
    pub retry: Option<RetryBehavior>,
    /// Name of the completion callback to deliver the terminal result to.
    pub on_complete: Option<String>,
    /// Opaque caller context, round-tripped unmodified to the callback.
    pub context: Option<ValueRef>,
}

/// Options for [`Engine::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub on_complete: Option<String>,
    pub context: Option<ValueRef>,
}

pub(crate) struct EngineShared {
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) hub: CompletionHub,
    pub(crate) pools: RwLock<HashMap<String, Arc<PoolScheduler>>>,
    pub(crate) definitions: RwLock<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    pub(crate) drivers: Mutex<HashMap<WorkflowId, JoinHandle<()>>>,
    pub(crate) workflow_pool: Arc<PoolScheduler>,
}

/// The durable task orchestration engine.
///
/// Owns the pool schedulers, the workflow drivers, and the completion
/// dispatcher, all backed by one [`StateStore`]. Cloning is cheap and
/// clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(
        state: Arc<dyn StateStore>,
        executor: Arc<dyn TaskExecutor>,
        config: EngineConfig,
    ) -> Self {
        let hub = CompletionHub::default();
        let dispatcher = Arc::new(Dispatcher::new(state.clone()));
        let workflow_pool = PoolScheduler::spawn(
            config.workflow_pool,
            state.clone(),
            executor.clone(),
            dispatcher.clone(),
            hub.clone(),
        );
        let mut pools = HashMap::new();
        pools.insert(workflow_pool.config().name.clone(), workflow_pool.clone());
        Self {
            shared: Arc::new(EngineShared {
                state,
                executor,
                dispatcher,
                hub,
                pools: RwLock::new(pools),
                definitions: RwLock::new(HashMap::new()),
                drivers: Mutex::new(HashMap::new()),
                workflow_pool,
            }),
        }
    }

    /// Create a pool and start its admission loop.
    pub async fn create_pool(&self, config: PoolConfig) -> Result<()> {
        let mut pools = self.shared.pools.write().await;
        ensure!(
            !pools.contains_key(&config.name),
            EngineError::PoolAlreadyExists {
                name: config.name.clone()
            }
        );
        let name = config.name.clone();
        let scheduler = PoolScheduler::spawn(
            config,
            self.shared.state.clone(),
            self.shared.executor.clone(),
            self.shared.dispatcher.clone(),
            self.shared.hub.clone(),
        );
        pools.insert(name, scheduler);
        Ok(())
    }

    pub async fn register_callback(
        &self,
        name: impl Into<String>,
        callback: Arc<dyn CompletionCallback>,
    ) {
        self.shared.dispatcher.register(name, callback).await;
    }

    pub async fn register_definition(&self, definition: Arc<dyn WorkflowDefinition>) {
        let name = definition.name().to_string();
        self.shared.definitions.write().await.insert(name, definition);
    }

    /// Enqueue a task onto a pool. Returns immediately with the new
    /// item's id; the terminal result is observed via `on_complete`.
    pub async fn enqueue(
        &self,
        pool: &str,
        kind: WorkKind,
        handler: &str,
        payload: ValueRef,
        options: EnqueueOptions,
    ) -> Result<WorkId> {
        let scheduler = {
            self.shared.pools.read().await.get(pool).cloned()
        }
        .ok_or_else(|| {
            Report::new(EngineError::PoolNotFound {
                name: pool.to_string(),
            })
        })?;

        let now = Utc::now();
        let scheduled_at = match options.run_after {
            Some(delay) => after_millis(now, delay.as_millis().min(u64::MAX as u128) as u64),
            None => now,
        };
        let retry = options
            .retry
            .unwrap_or_else(|| scheduler.config().retry_for(kind));
        let item = WorkItem {
            id: WorkId::new(),
            pool: pool.to_string(),
            kind,
            handler: handler.to_string(),
            payload,
            status: WorkStatus::Pending,
            attempts: Vec::new(),
            scheduled_at,
            retry,
            on_complete: options.on_complete,
            context: options.context,
            cancel_requested: false,
            result: None,
            enqueued_seq: 0,
        };
        let stored = scheduler.submit(item).await?;
        Ok(stored.id)
    }

    /// Caller-facing progress of a work item.
    pub async fn status(&self, id: WorkId) -> Result<WorkProgress> {
        let item = self
            .shared
            .state
            .get_work_item(id)
            .await
            .map_err(map_state_err)?
            .ok_or_else(|| Report::new(EngineError::WorkItemNotFound { id }))?;
        Ok(item.progress())
    }

    /// Request cancellation of a work item. Pending items are canceled
    /// immediately; a Running item finishes its in-flight attempt first.
    pub async fn cancel(&self, id: WorkId) -> Result<()> {
        cancel_work(&self.shared, id).await
    }

    /// Request cancellation of every non-terminal item of a pool.
    pub async fn cancel_all(&self, pool: &str) -> Result<()> {
        ensure!(
            self.shared.pools.read().await.contains_key(pool),
            EngineError::PoolNotFound {
                name: pool.to_string()
            }
        );
        let items = self
            .shared
            .state
            .list_work_items(&WorkItemFilters {
                pool: Some(pool.to_string()),
                ..WorkItemFilters::default()
            })
            .await
            .change_context(EngineError::State)?;
        for item in items {
            if !item.status.is_terminal() {
                cancel_work(&self.shared, item.id).await?;
            }
        }
        Ok(())
    }

    /// Start a new instance of a registered workflow definition.
    pub async fn start(
        &self,
        definition: &str,
        args: ValueRef,
        options: StartOptions,
    ) -> Result<WorkflowId> {
        let def = {
            self.shared.definitions.read().await.get(definition).cloned()
        }
        .ok_or_else(|| {
            Report::new(EngineError::DefinitionNotFound {
                name: definition.to_string(),
            })
        })?;

        let size = args
            .serialized_size()
            .change_context(EngineError::Internal)?;
        ensure!(
            size <= MAX_PAYLOAD_BYTES,
            EngineError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES
            }
        );

        let instance = WorkflowInstance {
            id: WorkflowId::new(),
            definition: definition.to_string(),
            args,
            status: WorkflowStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            on_complete: options.on_complete,
            context: options.context,
        };
        let id = instance.id;
        self.shared
            .state
            .create_workflow(instance.clone())
            .await
            .change_context(EngineError::State)?;
        self.spawn_driver(def, instance).await;
        Ok(id)
    }

    async fn spawn_driver(&self, definition: Arc<dyn WorkflowDefinition>, instance: WorkflowInstance) {
        let id = instance.id;
        let handle = tokio::spawn(workflow::drive_instance(
            self.shared.clone(),
            self.shared.workflow_pool.clone(),
            definition,
            instance,
        ));
        self.shared.drivers.lock().await.insert(id, handle);
    }

    /// Caller-facing progress of a workflow instance.
    pub async fn workflow_status(&self, id: WorkflowId) -> Result<WorkflowProgress> {
        let instance = self
            .shared
            .state
            .get_workflow(id)
            .await
            .map_err(map_state_err)?
            .ok_or_else(|| Report::new(EngineError::WorkflowNotFound { id }))?;
        Ok(instance.progress())
    }

    /// Cancel a workflow instance.
    ///
    /// The instance is finished as Canceled immediately (first terminal
    /// writer wins); outstanding step items are canceled cooperatively,
    /// and the body stops at its next step boundary.
    pub async fn cancel_workflow(&self, id: WorkflowId) -> Result<()> {
        let instance = self
            .shared
            .state
            .get_workflow(id)
            .await
            .map_err(map_state_err)?
            .ok_or_else(|| Report::new(EngineError::WorkflowNotFound { id }))?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        let finished = self
            .shared
            .state
            .finish_workflow(id, WorkflowStatus::Canceled, TaskResult::Canceled)
            .await
            .map_err(map_state_err)?;
        workflow::cancel_outstanding_steps(&self.shared, id).await?;

        // Dispatch here rather than from the driver: the driver may not
        // be running (e.g. pre-recovery). The intent journal dedupes
        // against the driver's own dispatch.
        if finished.status == WorkflowStatus::Canceled {
            if let Some(result) = &finished.result {
                if let Err(error) = self
                    .shared
                    .dispatcher
                    .dispatch(
                        DispatchSubject::Workflow(id),
                        finished.on_complete.as_deref(),
                        result,
                        finished.context.as_ref(),
                    )
                    .await
                {
                    tracing::error!(?error, workflow_id = %id, "cancellation dispatch failed");
                }
            }
        }
        Ok(())
    }

    /// Remove the durable record of a terminal work item.
    pub async fn cleanup_work(&self, id: WorkId) -> Result<()> {
        self.shared
            .state
            .remove_work_item(id)
            .await
            .map_err(map_state_err)
    }

    /// Remove the durable record of a terminal workflow instance, its
    /// journal, and the terminal work items of its steps.
    pub async fn cleanup_workflow(&self, id: WorkflowId) -> Result<()> {
        let records = self
            .shared
            .state
            .list_step_records(id)
            .await
            .change_context(EngineError::State)?;
        self.shared
            .state
            .remove_workflow(id)
            .await
            .map_err(map_state_err)?;
        for record in records {
            match self.shared.state.remove_work_item(record.work_id).await {
                Ok(()) => {}
                Err(error) => match error.current_context() {
                    StateError::WorkItemNotFound { .. } => {}
                    StateError::NotTerminal { .. } => {
                        tracing::debug!(work_id = %record.work_id, "step item still live, leaving it");
                    }
                    _ => tracing::error!(?error, work_id = %record.work_id, "failed to remove step item"),
                },
            }
        }
        if let Some(handle) = self.shared.drivers.lock().await.remove(&id) {
            handle.abort();
        }
        Ok(())
    }

    /// Recover after a restart. Call once at startup, after registering
    /// pools, definitions, and callbacks, before enqueueing new work.
    ///
    /// Closes attempts interrupted mid-flight (they count toward
    /// `max_attempts`), re-drives unconfirmed completion deliveries, and
    /// resumes in-flight workflow instances from their journals.
    pub async fn recover(&self) -> Result<()> {
        let now = Utc::now();

        // Items stuck Running died with the previous process.
        let stuck = self
            .shared
            .state
            .list_work_items(&WorkItemFilters {
                status: Some(WorkStatus::Running),
                ..WorkItemFilters::default()
            })
            .await
            .change_context(EngineError::State)?;
        for item in stuck {
            let attempts_so_far = item.completed_attempts() as u32 + 1;
            let retry_at = match retry::decide(attempts_so_far, &item.retry) {
                RetryDecision::Retry { delay_ms } => Some(after_millis(now, delay_ms)),
                RetryDecision::GiveUp => None,
            };
            match self
                .shared
                .state
                .finish_attempt(item.id, now, AttemptOutcome::Crashed, retry_at)
                .await
            {
                Ok(updated) if updated.status.is_terminal() => {
                    tracing::warn!(work_id = %updated.id, status = %updated.status, "interrupted attempt exhausted retries");
                    if let Some(result) = &updated.result {
                        self.shared.hub.complete(updated.id, result);
                        if let Err(error) = self
                            .shared
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
                Ok(updated) => {
                    tracing::info!(work_id = %updated.id, scheduled_at = %updated.scheduled_at, "interrupted attempt rescheduled");
                }
                Err(error) => {
                    tracing::error!(?error, work_id = %item.id, "failed to close interrupted attempt");
                }
            }
        }

        // Terminal records whose callbacks were never confirmed delivered.
        // Dispatch is idempotent against the intent journal, so this is
        // safe to run for every terminal record with a callback.
        let items = self
            .shared
            .state
            .list_work_items(&WorkItemFilters::default())
            .await
            .change_context(EngineError::State)?;
        for item in items {
            if !item.status.is_terminal() || item.on_complete.is_none() {
                continue;
            }
            if let Some(result) = &item.result {
                let subject = DispatchSubject::Work(item.id);
                if let Err(error) = self
                    .shared
                    .dispatcher
                    .dispatch(subject, item.on_complete.as_deref(), result, item.context.as_ref())
                    .await
                {
                    tracing::error!(?error, %subject, "completion redelivery failed");
                }
            }
        }
        let workflows = self
            .shared
            .state
            .list_workflows(&WorkflowFilters::default())
            .await
            .change_context(EngineError::State)?;
        for instance in &workflows {
            if !instance.status.is_terminal() || instance.on_complete.is_none() {
                continue;
            }
            if let Some(result) = &instance.result {
                let subject = DispatchSubject::Workflow(instance.id);
                if let Err(error) = self
                    .shared
                    .dispatcher
                    .dispatch(
                        subject,
                        instance.on_complete.as_deref(),
                        result,
                        instance.context.as_ref(),
                    )
                    .await
                {
                    tracing::error!(?error, %subject, "completion redelivery failed");
                }
            }
        }

        // Intents left unresolved at this point belong to subjects whose
        // records were cleaned up, or to deliveries that failed again
        // above; both get one more attempt.
        match self.shared.dispatcher.redrive().await {
            Ok(count) if count > 0 => {
                tracing::info!(count, "re-drove unconfirmed completion deliveries");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(?error, "intent redrive failed");
            }
        }

        // Resume in-flight workflow instances from their journals.
        for instance in workflows {
            if instance.status != WorkflowStatus::InProgress {
                continue;
            }
            let definition = {
                self.shared
                    .definitions
                    .read()
                    .await
                    .get(&instance.definition)
                    .cloned()
            };
            match definition {
                Some(definition) => self.spawn_driver(definition, instance).await,
                None => {
                    tracing::error!(
                        workflow_id = %instance.id,
                        definition = %instance.definition,
                        "cannot resume workflow, definition not registered"
                    );
                    let result = TaskResult::Error {
                        error: TaskError::new(
                            ERROR_CODE_INTERNAL,
                            format!("workflow definition not registered: {}", instance.definition),
                        ),
                    };
                    match self
                        .shared
                        .state
                        .finish_workflow(instance.id, WorkflowStatus::Failed, result)
                        .await
                    {
                        Ok(finished) => {
                            if let Some(result) = &finished.result {
                                if let Err(error) = self
                                    .shared
                                    .dispatcher
                                    .dispatch(
                                        DispatchSubject::Workflow(finished.id),
                                        finished.on_complete.as_deref(),
                                        result,
                                        finished.context.as_ref(),
                                    )
                                    .await
                                {
                                    tracing::error!(?error, workflow_id = %finished.id, "completion dispatch failed");
                                }
                            }
                        }
                        Err(error) => {
                            tracing::error!(?error, workflow_id = %instance.id, "failed to fail unresumable workflow");
                        }
                    }
                }
            }
        }

        // Pending items (including freshly rescheduled ones) may already
        // be ready.
        for scheduler in self.shared.pools.read().await.values() {
            scheduler.wake();
        }
        Ok(())
    }

    /// Abort every admission loop, in-flight attempt, and workflow
    /// driver without recording anything. Interrupted work is recovered
    /// by a later [`Engine::recover`] on the same store.
    pub async fn shutdown(&self) {
        for scheduler in self.shared.pools.read().await.values() {
            scheduler.shutdown();
        }
        let mut drivers = self.shared.drivers.lock().await;
        for (_, handle) in drivers.drain() {
            handle.abort();
        }
    }
}

/// Request cancellation of a work item and dispatch its completion if
/// the cancellation took effect immediately.
pub(crate) async fn cancel_work(shared: &Arc<EngineShared>, id: WorkId) -> Result<()> {
    let outcome = shared
        .state
        .request_cancel(id)
        .await
        .map_err(map_state_err)?;
    match outcome {
        CancelOutcome::CanceledPending(item) => {
            tracing::debug!(work_id = %item.id, "pending item canceled");
            shared.hub.complete(item.id, &TaskResult::Canceled);
            if let Err(error) = shared
                .dispatcher
                .dispatch(
                    DispatchSubject::Work(item.id),
                    item.on_complete.as_deref(),
                    &TaskResult::Canceled,
                    item.context.as_ref(),
                )
                .await
            {
                tracing::error!(?error, work_id = %item.id, "cancellation dispatch failed");
            }
        }
        CancelOutcome::FlagSet => {
            tracing::debug!(work_id = %id, "cancellation requested for running item");
        }
        CancelOutcome::AlreadyTerminal => {}
    }
    Ok(())
}

fn map_state_err(error: Report<StateError>) -> Report<EngineError> {
    let context = match error.current_context() {
        StateError::WorkItemNotFound { id } => EngineError::WorkItemNotFound { id: *id },
        StateError::WorkflowNotFound { id } => EngineError::WorkflowNotFound { id: *id },
        StateError::NotTerminal { .. } => EngineError::NotTerminal,
        _ => EngineError::State,
    };
    error.change_context(context)
}
