mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor_core::retry::RetryBehavior;
use conveyor_core::value::ValueRef;
use conveyor_core::work::{PoolConfig, WorkKind, WorkProgress};
use conveyor_core::{ERROR_CODE_INTERNAL, ERROR_CODE_SIZE_LIMIT, TaskError, TaskResult};
use conveyor_execution::testing::{MockBehavior, MockExecutor, RecordingCallback};
use conveyor_execution::{Engine, EngineConfig, EngineError, EnqueueOptions};
use conveyor_state::{DispatchSubject, InMemoryStateStore};
use serde_json::json;
use tokio::sync::watch;

fn engine_with(executor: MockExecutor) -> Engine {
    common::init_test_logging();
    let state = Arc::new(InMemoryStateStore::new());
    Engine::new(state, Arc::new(executor), EngineConfig::default())
}

fn with_callback(on_complete: &str) -> EnqueueOptions {
    EnqueueOptions {
        on_complete: Some(on_complete.to_string()),
        ..EnqueueOptions::default()
    }
}

#[tokio::test]
async fn test_pool_caps_concurrent_attempts() {
    let executor = MockExecutor::new();
    executor.always(
        "work",
        MockBehavior::ResultAfter(Duration::from_millis(50), json!(1)),
    );
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("limited", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    for _ in 0..6 {
        engine
            .enqueue(
                "limited",
                WorkKind::Action,
                "work",
                ValueRef::null(),
                with_callback("done"),
            )
            .await
            .unwrap();
    }

    common::wait_until(|| callback.deliveries().len() == 6, "all items to finish").await;
    assert_eq!(executor.calls("work"), 6);
    assert!(
        executor.max_concurrent() <= 2,
        "observed {} concurrent attempts",
        executor.max_concurrent()
    );
}

#[tokio::test]
async fn test_single_slot_pool_runs_in_enqueue_order() {
    let executor = MockExecutor::new();
    for handler in ["a", "b", "c"] {
        executor.script(
            handler,
            MockBehavior::ResultAfter(Duration::from_millis(20), json!(null)),
        );
    }
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("serial", 1)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    for handler in ["a", "b", "c"] {
        engine
            .enqueue(
                "serial",
                WorkKind::Action,
                handler,
                ValueRef::null(),
                with_callback("done"),
            )
            .await
            .unwrap();
    }

    common::wait_until(|| callback.deliveries().len() == 3, "all items to finish").await;
    assert_eq!(executor.call_log(), vec!["a", "b", "c"]);
    assert_eq!(executor.max_concurrent(), 1);
}

#[tokio::test]
async fn test_success_delivers_the_value() {
    let executor = MockExecutor::new();
    executor.script("fetch", MockBehavior::Result(json!({"ok": true})));
    let engine = engine_with(executor);
    engine.create_pool(PoolConfig::new("p", 4)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let context = ValueRef::new(json!({"request": 7}));
    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "fetch",
            ValueRef::null(),
            EnqueueOptions {
                on_complete: Some("done".to_string()),
                context: Some(context.clone()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    let deliveries = callback.deliveries();
    assert_eq!(deliveries[0].0, DispatchSubject::Work(id));
    assert_eq!(
        deliveries[0].1,
        TaskResult::Success {
            value: ValueRef::new(json!({"ok": true}))
        }
    );
    // Context is round-tripped unmodified.
    assert_eq!(deliveries[0].2, context);
    assert_eq!(engine.status(id).await.unwrap(), WorkProgress::Finished);
}

#[tokio::test]
async fn test_failed_action_retries_until_exhausted() {
    let executor = MockExecutor::new();
    executor.always("flaky", MockBehavior::Error(TaskError::new(500, "boom")));
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "flaky",
            ValueRef::null(),
            EnqueueOptions {
                retry: Some(RetryBehavior::backoff(3, 10, 2.0)),
                on_complete: Some("done".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    assert_eq!(executor.calls("flaky"), 3);
    assert!(matches!(
        &callback.deliveries()[0].1,
        TaskResult::Error { error } if error.message == "boom"
    ));
}

#[tokio::test]
async fn test_no_retry_without_a_policy() {
    let executor = MockExecutor::new();
    executor.always("flaky", MockBehavior::Error(TaskError::new(500, "boom")));
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    // No explicit retry and the pool does not retry actions by default.
    let id = engine
        .enqueue("p", WorkKind::Action, "flaky", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    assert_eq!(executor.calls("flaky"), 1);
}

#[tokio::test]
async fn test_pool_default_retry_applies_to_actions() {
    let executor = MockExecutor::new();
    executor.script("flaky", MockBehavior::Error(TaskError::new(500, "boom")));
    executor.script("flaky", MockBehavior::Result(json!("recovered")));
    let engine = engine_with(executor.clone());
    engine
        .create_pool(
            PoolConfig::new("p", 2)
                .with_default_retry(RetryBehavior::backoff(3, 10, 2.0))
                .with_retry_actions_by_default(true),
        )
        .await
        .unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .enqueue("p", WorkKind::Action, "flaky", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    assert_eq!(executor.calls("flaky"), 2);
    assert_eq!(
        callback.deliveries()[0].1,
        TaskResult::Success {
            value: ValueRef::new(json!("recovered"))
        }
    );
}

#[tokio::test]
async fn test_cancel_pending_item_never_runs() {
    let executor = MockExecutor::new();
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "never",
            ValueRef::null(),
            EnqueueOptions {
                run_after: Some(Duration::from_secs(60)),
                on_complete: Some("done".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    engine.cancel(id).await.unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    assert_eq!(callback.deliveries()[0].1, TaskResult::Canceled);
    assert_eq!(executor.calls("never"), 0);
    assert_eq!(engine.status(id).await.unwrap(), WorkProgress::Finished);
}

#[tokio::test]
async fn test_cancel_running_item_waits_for_the_attempt() {
    let executor = MockExecutor::new();
    let (gate, gate_rx) = watch::channel(false);
    executor.script("slow", MockBehavior::ResultWhen(gate_rx, json!(42)));
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "slow",
            ValueRef::null(),
            EnqueueOptions {
                retry: Some(RetryBehavior::backoff(5, 10, 2.0)),
                on_complete: Some("done".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    common::wait_until(|| executor.calls("slow") == 1, "attempt to start").await;

    engine.cancel(id).await.unwrap();
    // Cancellation is cooperative: the in-flight attempt is not preempted.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(callback.deliveries().is_empty());

    gate.send(true).unwrap();
    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    // Cancellation overrides the attempt's own success and suppresses retries.
    assert_eq!(callback.deliveries()[0].1, TaskResult::Canceled);
    assert_eq!(executor.calls("slow"), 1);
}

#[tokio::test]
async fn test_cancel_all_pool_items() {
    let executor = MockExecutor::new();
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    for _ in 0..3 {
        engine
            .enqueue(
                "p",
                WorkKind::Action,
                "never",
                ValueRef::null(),
                EnqueueOptions {
                    run_after: Some(Duration::from_secs(60)),
                    on_complete: Some("done".to_string()),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
    }
    engine.cancel_all("p").await.unwrap();

    common::wait_until(|| callback.deliveries().len() == 3, "deliveries").await;
    assert!(callback
        .deliveries()
        .iter()
        .all(|(_, result, _)| *result == TaskResult::Canceled));
    assert_eq!(executor.calls("never"), 0);
}

#[tokio::test]
async fn test_run_after_delays_admission() {
    let executor = MockExecutor::new();
    executor.script("later", MockBehavior::Result(json!(null)));
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let started = Instant::now();
    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "later",
            ValueRef::null(),
            EnqueueOptions {
                run_after: Some(Duration::from_millis(100)),
                on_complete: Some("done".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(executor.calls("later"), 0);
    assert!(matches!(
        engine.status(id).await.unwrap(),
        WorkProgress::Pending { .. }
    ));

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_enormous_run_after_stays_pending() {
    let executor = MockExecutor::new();
    executor.script("never", MockBehavior::Result(json!(null)));
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();

    // A delay past the end of representable time is accepted and the
    // item just never becomes ready.
    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "never",
            ValueRef::null(),
            EnqueueOptions {
                run_after: Some(Duration::from_millis(u64::MAX)),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.calls("never"), 0);
    assert!(matches!(
        engine.status(id).await.unwrap(),
        WorkProgress::Pending { .. }
    ));
}

#[tokio::test]
async fn test_panicking_handler_fails_the_attempt() {
    let executor = MockExecutor::new();
    executor.script("explode", MockBehavior::Panic("kaboom".to_string()));
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .enqueue("p", WorkKind::Action, "explode", ValueRef::null(), with_callback("done"))
        .await
        .unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    assert!(matches!(
        &callback.deliveries()[0].1,
        TaskResult::Error { error } if error.code == ERROR_CODE_INTERNAL
    ));
}

#[tokio::test]
async fn test_oversized_payload_is_rejected_at_enqueue() {
    let engine = engine_with(MockExecutor::new());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();

    let payload = ValueRef::new(json!("x".repeat(2 * 1024 * 1024)));
    let error = engine
        .enqueue("p", WorkKind::Action, "big", payload, EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        error.current_context(),
        EngineError::PayloadTooLarge { .. }
    ));
}

#[tokio::test]
async fn test_oversized_result_fails_without_retrying() {
    let executor = MockExecutor::new();
    executor.always(
        "big",
        MockBehavior::Result(json!("x".repeat(2 * 1024 * 1024))),
    );
    let engine = engine_with(executor.clone());
    engine.create_pool(PoolConfig::new("p", 2)).await.unwrap();
    let callback = RecordingCallback::new();
    engine.register_callback("done", callback.clone()).await;

    let id = engine
        .enqueue(
            "p",
            WorkKind::Action,
            "big",
            ValueRef::null(),
            EnqueueOptions {
                retry: Some(RetryBehavior::backoff(5, 10, 2.0)),
                on_complete: Some("done".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    common::wait_until(|| callback.delivered(DispatchSubject::Work(id)) == 1, "delivery").await;
    // Re-running would just produce another oversized result.
    assert_eq!(executor.calls("big"), 1);
    assert!(matches!(
        &callback.deliveries()[0].1,
        TaskResult::Error { error } if error.code == ERROR_CODE_SIZE_LIMIT
    ));
}

#[tokio::test]
async fn test_unknown_pool_is_rejected() {
    let engine = engine_with(MockExecutor::new());
    let error = engine
        .enqueue("nope", WorkKind::Action, "x", ValueRef::null(), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        error.current_context(),
        EngineError::PoolNotFound { .. }
    ));

    let error = engine
        .create_pool(PoolConfig::new("workflows", 1))
        .await
        .unwrap_err();
    assert!(matches!(
        error.current_context(),
        EngineError::PoolAlreadyExists { .. }
    ));
}
