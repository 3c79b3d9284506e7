mod common;

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::retry::RetryBehavior;
use conveyor_core::value::ValueRef;
use conveyor_core::work::WorkKind;
use conveyor_core::workflow::WorkflowProgress;
use conveyor_core::{TaskError, TaskResult};
use conveyor_execution::testing::{MockBehavior, MockExecutor, RecordingCallback};
use conveyor_execution::{
    Engine, EngineConfig, EngineError, StartOptions, StepError, StepOptions, WorkflowContext,
    WorkflowDefinition,
};
use conveyor_state::{DispatchSubject, InMemoryStateStore};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::watch;

fn engine_with(executor: MockExecutor) -> Engine {
    common::init_test_logging();
    let state = Arc::new(InMemoryStateStore::new());
    Engine::new(state, Arc::new(executor), EngineConfig::default())
}

fn with_callback(on_complete: &str) -> StartOptions {
    StartOptions {
        on_complete: Some(on_complete.to_string()),
        ..StartOptions::default()
    }
}

/// fetch, then store the fetched value.
struct TwoStep;

impl WorkflowDefinition for TwoStep {
    fn name(&self) -> &str {
        "two_step"
    }

    fn run(
        &self,
        ctx: WorkflowContext,
        args: ValueRef,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move {
            let fetched = ctx.run_action("fetch", args).await?.await?;
            let stored = ctx.run_mutation("store", fetched).await?.await?;
            Ok(stored)
        }
        .boxed()
    }
}

/// Issues two steps before awaiting either, so they run in parallel.
struct FanOut;

impl WorkflowDefinition for FanOut {
    fn name(&self) -> &str {
        "fan_out"
    }

    fn run(
        &self,
        ctx: WorkflowContext,
        args: ValueRef,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move {
            let left = ctx.run_action("left", args.clone()).await?;
            let right = ctx.run_action("right", args).await?;
            let (left, right) = futures::future::try_join(left, right).await?;
            Ok(ValueRef::new(json!([
                left.as_ref().clone(),
                right.as_ref().clone()
            ])))
        }
        .boxed()
    }
}

/// One step with its own retry policy.
struct Retrying;

impl WorkflowDefinition for Retrying {
    fn name(&self) -> &str {
        "retrying"
    }

    fn run(
        &self,
        ctx: WorkflowContext,
        args: ValueRef,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move {
            let value = ctx
                .step(
                    WorkKind::Action,
                    "wobbly",
                    args,
                    StepOptions {
                        retry: Some(RetryBehavior::backoff(3, 10, 2.0)),
                        ..StepOptions::default()
                    },
                )
                .await?
                .await?;
            Ok(value)
        }
        .boxed()
    }
}

/// A gated step followed by one that must never run after cancellation.
struct Cancelable;

impl WorkflowDefinition for Cancelable {
    fn name(&self) -> &str {
        "cancelable"
    }

    fn run(
        &self,
        ctx: WorkflowContext,
        args: ValueRef,
    ) -> BoxFuture<'static, Result<ValueRef, StepError>> {
        async move {
            let first = ctx.run_action("gated", args).await?.await?;
            let second = ctx.run_action("after_cancel", first).await?.await?;
            Ok(second)
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_sequential_steps_pass_values_through() {
    let executor = MockExecutor::new();
    executor.script("fetch", MockBehavior::Result(json!(21)));
    executor.script("store", MockBehavior::Result(json!(42)));
    let engine = engine_with(executor.clone());
    engine.register_definition(Arc::new(TwoStep)).await;
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let context = ValueRef::new(json!({"request": "r-17"}));
    let id = engine
        .start(
            "two_step",
            ValueRef::new(json!({"url": "a"})),
            StartOptions {
                context: Some(context.clone()),
                ..with_callback("done")
            },
        )
        .await
        .unwrap();

    common::wait_until(
        || callback.delivered(DispatchSubject::Workflow(id)) == 1,
        "workflow to finish",
    )
    .await;
    assert_eq!(executor.call_log(), vec!["fetch", "store"]);
    assert_eq!(
        callback.deliveries()[0].1,
        TaskResult::Success {
            value: ValueRef::new(json!(42))
        }
    );
    // The caller's context comes back untouched with the delivery.
    assert_eq!(callback.deliveries()[0].2, context);
    assert_eq!(
        engine.workflow_status(id).await.unwrap(),
        WorkflowProgress::Completed {
            value: ValueRef::new(json!(42))
        }
    );
}

#[tokio::test]
async fn test_steps_issued_together_run_in_parallel() {
    let executor = MockExecutor::new();
    let (gate, gate_rx) = watch::channel(false);
    executor.script("left", MockBehavior::ResultWhen(gate_rx, json!(1)));
    executor.script("right", MockBehavior::Result(json!(2)));
    let engine = engine_with(executor.clone());
    engine.register_definition(Arc::new(FanOut)).await;
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .start("fan_out", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();

    // The right step finishes while the left one is still blocked.
    common::wait_until(|| executor.calls("right") == 1, "right step to run").await;
    assert_eq!(executor.calls("left"), 1);
    assert!(callback.deliveries().is_empty());

    gate.send(true).unwrap();
    common::wait_until(
        || callback.delivered(DispatchSubject::Workflow(id)) == 1,
        "workflow to finish",
    )
    .await;
    assert_eq!(
        callback.deliveries()[0].1,
        TaskResult::Success {
            value: ValueRef::new(json!([1, 2]))
        }
    );
}

#[tokio::test]
async fn test_step_failure_fails_the_workflow() {
    let executor = MockExecutor::new();
    executor.script("fetch", MockBehavior::Error(TaskError::new(500, "upstream down")));
    let engine = engine_with(executor.clone());
    engine.register_definition(Arc::new(TwoStep)).await;
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .start("two_step", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();

    common::wait_until(
        || callback.delivered(DispatchSubject::Workflow(id)) == 1,
        "workflow to finish",
    )
    .await;
    assert!(matches!(
        engine.workflow_status(id).await.unwrap(),
        WorkflowProgress::Failed { error } if error.message.contains("upstream down")
    ));
    // The second step is never issued.
    assert_eq!(executor.calls("store"), 0);
}

#[tokio::test]
async fn test_step_retry_policy_is_honored() {
    let executor = MockExecutor::new();
    executor.script("wobbly", MockBehavior::Error(TaskError::new(500, "hiccup")));
    executor.script("wobbly", MockBehavior::Result(json!("steady")));
    let engine = engine_with(executor.clone());
    engine.register_definition(Arc::new(Retrying)).await;
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .start("retrying", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();

    common::wait_until(
        || callback.delivered(DispatchSubject::Workflow(id)) == 1,
        "workflow to finish",
    )
    .await;
    assert_eq!(executor.calls("wobbly"), 2);
    assert_eq!(
        callback.deliveries()[0].1,
        TaskResult::Success {
            value: ValueRef::new(json!("steady"))
        }
    );
}

#[tokio::test]
async fn test_cancel_workflow_stops_at_the_next_step_boundary() {
    let executor = MockExecutor::new();
    let (gate, gate_rx) = watch::channel(false);
    executor.script("gated", MockBehavior::ResultWhen(gate_rx, json!(1)));
    let engine = engine_with(executor.clone());
    engine.register_definition(Arc::new(Cancelable)).await;
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .start("cancelable", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();
    common::wait_until(|| executor.calls("gated") == 1, "first step to start").await;

    engine.cancel_workflow(id).await.unwrap();
    // The instance is terminal immediately, without waiting for the
    // in-flight step.
    assert_eq!(
        engine.workflow_status(id).await.unwrap(),
        WorkflowProgress::Canceled
    );

    gate.send(true).unwrap();
    common::wait_until(
        || callback.delivered(DispatchSubject::Workflow(id)) > 0,
        "cancellation delivery",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(callback.delivered(DispatchSubject::Workflow(id)), 1);
    assert_eq!(
        callback.deliveries()[0].1,
        TaskResult::Canceled
    );
    // The body never got past the canceled step.
    assert_eq!(executor.calls("after_cancel"), 0);
}

#[tokio::test]
async fn test_start_requires_a_registered_definition() {
    let engine = engine_with(MockExecutor::new());
    let error = engine
        .start("ghost", ValueRef::null(), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        error.current_context(),
        EngineError::DefinitionNotFound { .. }
    ));
}
