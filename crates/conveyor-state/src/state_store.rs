use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use conveyor_core::TaskResult;
use conveyor_core::value::ValueRef;
use conveyor_core::work::{AttemptOutcome, WorkId, WorkItem, WorkStatus};
use conveyor_core::workflow::{StepRecord, WorkflowId, WorkflowInstance, WorkflowStatus};

use crate::StateError;

/// Trait for the durable store backing the engine.
///
/// Implementations must apply every mutation of a single record as an
/// atomic read-modify-write: a runner recording an attempt outcome and a
/// scheduler re-admitting the same item must never interleave. The
/// in-memory implementation holds a write lock across each transition;
/// a persistent implementation would use per-record compare-and-set.
pub trait StateStore: Send + Sync {
    // Work items

    /// Persist a new work item and assign its admission sequence number.
    ///
    /// Returns the stored record (with `enqueued_seq` filled in).
    fn create_work_item(
        &self,
        item: WorkItem,
    ) -> BoxFuture<'_, error_stack::Result<WorkItem, StateError>>;

    /// Fetch a work item by id.
    fn get_work_item(
        &self,
        id: WorkId,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkItem>, StateError>>;

    /// Atomically claim the oldest ready item of a pool.
    ///
    /// "Ready" means status Pending and `scheduled_at <= now`; ordering
    /// is FIFO by `scheduled_at`, tie-broken by `enqueued_seq`. The
    /// claimed item transitions to Running with a fresh open attempt in
    /// the same transaction. Returns `None` when nothing is ready.
    /// Capacity is enforced by the caller (a single admission loop per
    /// pool), which tracks in-flight attempts in memory.
    fn claim_next_ready(
        &self,
        pool: &str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkItem>, StateError>>;

    /// Earliest `scheduled_at` among the pool's Pending items, for
    /// admission-loop timer scheduling.
    fn next_scheduled_at(
        &self,
        pool: &str,
    ) -> BoxFuture<'_, error_stack::Result<Option<DateTime<Utc>>, StateError>>;

    /// Atomically record the outcome of the open attempt and apply the
    /// resulting transition:
    ///
    /// - `cancel_requested` set → Canceled with a Canceled result,
    ///   regardless of the attempt's own outcome (cancellation overrides
    ///   success and suppresses retries);
    /// - `Succeeded { value }` → Succeeded with a Success result;
    /// - `Failed`/`Crashed` with `retry_at` → back to Pending, scheduled
    ///   at `retry_at`;
    /// - `Failed`/`Crashed` without `retry_at` → Failed with an Error
    ///   result.
    ///
    /// Returns the updated record so the caller can observe the final
    /// status it must dispatch for.
    fn finish_attempt(
        &self,
        id: WorkId,
        ended_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        retry_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, error_stack::Result<WorkItem, StateError>>;

    /// Atomically request cancellation of a work item.
    ///
    /// Pending items transition straight to Canceled; Running items get
    /// their `cancel_requested` flag set for the runner to observe;
    /// terminal items are left untouched.
    fn request_cancel(
        &self,
        id: WorkId,
    ) -> BoxFuture<'_, error_stack::Result<CancelOutcome, StateError>>;

    /// List work items matching the filters, ordered by enqueue sequence.
    fn list_work_items(
        &self,
        filters: &WorkItemFilters,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkItem>, StateError>>;

    /// Remove the durable record of a terminal work item.
    ///
    /// Fails with [`StateError::NotTerminal`] on a non-terminal item.
    fn remove_work_item(&self, id: WorkId)
    -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    // Workflow instances

    /// Persist a new workflow instance.
    fn create_workflow(
        &self,
        instance: WorkflowInstance,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Fetch a workflow instance by id.
    fn get_workflow(
        &self,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkflowInstance>, StateError>>;

    /// Atomically move an instance to a terminal status with its result.
    ///
    /// The first terminal transition wins: finishing an already-terminal
    /// instance leaves it unchanged. Returns the stored record either
    /// way, so racing finishers (a driver completing versus a concurrent
    /// cancellation) converge on one terminal result.
    fn finish_workflow(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        result: TaskResult,
    ) -> BoxFuture<'_, error_stack::Result<WorkflowInstance, StateError>>;

    /// List workflow instances matching the filters.
    fn list_workflows(
        &self,
        filters: &WorkflowFilters,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowInstance>, StateError>>;

    /// Remove the durable record of a terminal instance and its journal.
    ///
    /// Fails with [`StateError::NotTerminal`] on a non-terminal instance.
    fn remove_workflow(
        &self,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    // Journal

    /// Append a step record to an instance's journal.
    ///
    /// The journal is append-only during forward execution:
    /// `record.step_index` must equal the current journal length.
    fn append_step_record(
        &self,
        workflow_id: WorkflowId,
        record: StepRecord,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Record the terminal result of a journaled step. Idempotent for
    /// the same result.
    fn record_step_result(
        &self,
        workflow_id: WorkflowId,
        step_index: usize,
        result: TaskResult,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// List an instance's journal in step order.
    fn list_step_records(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Vec<StepRecord>, StateError>>;

    // Dispatch intents

    /// Journal the intent to deliver a completion callback.
    ///
    /// Recording is idempotent per subject: a second record for an
    /// already-resolved intent reports [`IntentState::AlreadyResolved`]
    /// so the callback is not re-invoked after a confirmed delivery.
    fn record_dispatch_intent(
        &self,
        intent: DispatchIntent,
    ) -> BoxFuture<'_, error_stack::Result<IntentState, StateError>>;

    /// Mark a journaled intent as delivered.
    fn resolve_dispatch_intent(
        &self,
        subject: DispatchSubject,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Intents journaled but not yet confirmed delivered, for recovery.
    fn list_unresolved_intents(
        &self,
    ) -> BoxFuture<'_, error_stack::Result<Vec<DispatchIntent>, StateError>>;
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The item was Pending and is now Canceled; the caller is
    /// responsible for dispatching its completion.
    CanceledPending(WorkItem),
    /// The item is Running; the flag is set and the runner will finish
    /// the cancellation after the in-flight attempt.
    FlagSet,
    /// The item was already terminal; nothing to do.
    AlreadyTerminal,
}

/// Filters for listing work items.
#[derive(Debug, Clone, Default)]
pub struct WorkItemFilters {
    pub pool: Option<String>,
    pub status: Option<WorkStatus>,
    pub limit: Option<usize>,
}

/// Filters for listing workflow instances.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilters {
    pub status: Option<WorkflowStatus>,
    pub definition: Option<String>,
}

/// What a completion dispatch is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "subject", content = "id")]
pub enum DispatchSubject {
    Work(WorkId),
    Workflow(WorkflowId),
}

impl std::fmt::Display for DispatchSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchSubject::Work(id) => write!(f, "work:{id}"),
            DispatchSubject::Workflow(id) => write!(f, "workflow:{id}"),
        }
    }
}

/// The journaled record of an intended completion delivery.
///
/// Written before the callback executes; resolved after the callback
/// returns. A crash in between leads to exactly one redelivery, so
/// callbacks must be idempotent per `(subject, result)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchIntent {
    pub subject: DispatchSubject,
    pub callback: String,
    pub result: TaskResult,
    pub context: Option<ValueRef>,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// State of an intent after recording it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    /// Newly journaled; the callback should run.
    Recorded,
    /// Journaled earlier but not confirmed; the callback should run
    /// again (redelivery).
    PendingRedelivery,
    /// Already confirmed delivered; do not invoke the callback.
    AlreadyResolved,
}
