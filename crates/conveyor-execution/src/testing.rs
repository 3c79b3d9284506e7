//! Scripted test doubles: a mock executor and a recording callback.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_core::value::ValueRef;
use conveyor_core::work::WorkKind;
use conveyor_core::{ERROR_CODE_INTERNAL, TaskError, TaskResult};
use conveyor_state::DispatchSubject;
use error_stack::Report;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::dispatch::{CallbackError, CompletionCallback};
use crate::executor::TaskExecutor;

/// Scripted behavior for one mock invocation.
#[derive(Clone)]
pub enum MockBehavior {
    /// Return the value immediately.
    Result(serde_json::Value),
    /// Fail immediately.
    Error(TaskError),
    /// Return the value after a delay.
    ResultAfter(Duration, serde_json::Value),
    /// Fail after a delay.
    ErrorAfter(Duration, TaskError),
    /// Block until the gate reads `true`, then return the value.
    ResultWhen(watch::Receiver<bool>, serde_json::Value),
    /// Panic inside the handler.
    Panic(String),
}

#[derive(Default)]
struct MockInner {
    scripts: Mutex<HashMap<String, VecDeque<MockBehavior>>>,
    fallbacks: Mutex<HashMap<String, MockBehavior>>,
    call_log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A [`TaskExecutor`] that plays back scripted behaviors per handler.
///
/// Scripted behaviors are consumed in order; when a handler's script is
/// exhausted its fallback (set via [`MockExecutor::always`]) is used. An
/// unscripted call fails the attempt.
#[derive(Clone, Default)]
pub struct MockExecutor {
    inner: Arc<MockInner>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot behavior for the handler.
    pub fn script(&self, handler: &str, behavior: MockBehavior) {
        let mut scripts = self.inner.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .entry(handler.to_string())
            .or_default()
            .push_back(behavior);
    }

    /// Set the behavior used when the handler's script is exhausted.
    pub fn always(&self, handler: &str, behavior: MockBehavior) {
        let mut fallbacks = self
            .inner
            .fallbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        fallbacks.insert(handler.to_string(), behavior);
    }

    /// Number of times the handler has been invoked.
    pub fn calls(&self, handler: &str) -> usize {
        let log = self.inner.call_log.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().filter(|h| h.as_str() == handler).count()
    }

    /// Handler names in invocation order.
    pub fn call_log(&self) -> Vec<String> {
        self.inner
            .call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// High-water mark of concurrently executing handlers.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<MockInner>);

impl InFlightGuard {
    fn enter(inner: Arc<MockInner>) -> Self {
        let current = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskExecutor for MockExecutor {
    fn execute(
        &self,
        _kind: WorkKind,
        handler: &str,
        _payload: ValueRef,
    ) -> BoxFuture<'static, Result<ValueRef, TaskError>> {
        let inner = self.inner.clone();
        let handler = handler.to_string();

        let behavior = {
            let mut scripts = inner.scripts.lock().unwrap_or_else(|e| e.into_inner());
            match scripts.get_mut(&handler).and_then(|queue| queue.pop_front()) {
                Some(behavior) => Some(behavior),
                None => inner
                    .fallbacks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&handler)
                    .cloned(),
            }
        };
        inner
            .call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler.clone());

        async move {
            let _guard = InFlightGuard::enter(inner);
            match behavior {
                None => Err(TaskError::new(
                    ERROR_CODE_INTERNAL,
                    format!("no scripted behavior for handler: {handler}"),
                )),
                Some(MockBehavior::Result(value)) => Ok(ValueRef::new(value)),
                Some(MockBehavior::Error(error)) => Err(error),
                Some(MockBehavior::ResultAfter(delay, value)) => {
                    tokio::time::sleep(delay).await;
                    Ok(ValueRef::new(value))
                }
                Some(MockBehavior::ErrorAfter(delay, error)) => {
                    tokio::time::sleep(delay).await;
                    Err(error)
                }
                Some(MockBehavior::ResultWhen(mut gate, value)) => {
                    // A dropped sender releases the gate.
                    let _ = gate.wait_for(|ready| *ready).await;
                    Ok(ValueRef::new(value))
                }
                Some(MockBehavior::Panic(message)) => panic!("{message}"),
            }
        }
        .boxed()
    }
}

/// A [`CompletionCallback`] that records every delivery it receives.
#[derive(Default)]
pub struct RecordingCallback {
    deliveries: Mutex<Vec<(DispatchSubject, TaskResult, ValueRef)>>,
    fail_budget: AtomicUsize,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` deliveries without recording them.
    pub fn fail_next(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<(DispatchSubject, TaskResult, ValueRef)> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of recorded deliveries for a subject.
    pub fn delivered(&self, subject: DispatchSubject) -> usize {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(s, _, _)| *s == subject)
            .count()
    }
}

impl CompletionCallback for RecordingCallback {
    fn complete(
        &self,
        subject: DispatchSubject,
        result: TaskResult,
        context: ValueRef,
    ) -> BoxFuture<'static, error_stack::Result<(), CallbackError>> {
        let failing = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                budget.checked_sub(1)
            })
            .is_ok();
        if failing {
            return async { Err(Report::new(CallbackError)) }.boxed();
        }
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((subject, result, context));
        async { Ok(()) }.boxed()
    }
}
