use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use conveyor_core::TaskResult;
use conveyor_core::value::ValueRef;
use conveyor_state::{DispatchIntent, DispatchSubject, IntentState, StateStore};
use error_stack::{Report, ResultExt as _};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error surfaced by a [`CompletionCallback`] implementation.
#[derive(Debug, Error)]
#[error("completion callback failed")]
pub struct CallbackError;

/// A named sink for terminal results.
///
/// Callbacks are delivered at least once: the intent is journaled before
/// invocation and only marked delivered after the callback returns, so a
/// crash in between leads to redelivery on recovery. Implementations must
/// be idempotent per subject.
pub trait CompletionCallback: Send + Sync {
    fn complete(
        &self,
        subject: DispatchSubject,
        result: TaskResult,
        context: ValueRef,
    ) -> BoxFuture<'static, error_stack::Result<(), CallbackError>>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("completion callback not registered: {name}")]
    CallbackNotRegistered { name: String },
    #[error("completion callback failed")]
    CallbackFailed,
    #[error("state store error")]
    State,
}

/// Delivers terminal results to registered callbacks with journaled intents.
pub struct Dispatcher {
    state: Arc<dyn StateStore>,
    callbacks: RwLock<HashMap<String, Arc<dyn CompletionCallback>>>,
}

impl Dispatcher {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self {
            state,
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, name: impl Into<String>, callback: Arc<dyn CompletionCallback>) {
        self.callbacks.write().await.insert(name.into(), callback);
    }

    /// Deliver a terminal result to the subject's callback, if any.
    ///
    /// Records the intent first and skips delivery if an earlier call
    /// already confirmed it. A failed or unregistered callback leaves the
    /// intent unresolved so [`Dispatcher::redrive`] can pick it up later.
    pub async fn dispatch(
        &self,
        subject: DispatchSubject,
        callback: Option<&str>,
        result: &TaskResult,
        context: Option<&ValueRef>,
    ) -> error_stack::Result<(), DispatchError> {
        let Some(name) = callback else {
            return Ok(());
        };

        let intent = DispatchIntent {
            subject,
            callback: name.to_string(),
            result: result.clone(),
            context: context.cloned(),
            recorded_at: Utc::now(),
            resolved_at: None,
        };
        let intent_state = self
            .state
            .record_dispatch_intent(intent)
            .await
            .change_context(DispatchError::State)?;
        if intent_state == IntentState::AlreadyResolved {
            tracing::debug!(%subject, "completion already delivered, skipping");
            return Ok(());
        }

        let callback = { self.callbacks.read().await.get(name).cloned() };
        let Some(callback) = callback else {
            return Err(Report::new(DispatchError::CallbackNotRegistered {
                name: name.to_string(),
            }));
        };

        callback
            .complete(subject, result.clone(), context.cloned().unwrap_or_else(ValueRef::null))
            .await
            .change_context(DispatchError::CallbackFailed)?;

        self.state
            .resolve_dispatch_intent(subject)
            .await
            .change_context(DispatchError::State)?;
        tracing::debug!(%subject, callback = name, "completion delivered");
        Ok(())
    }

    /// Re-drive every intent that was journaled but never confirmed
    /// delivered. Returns the number of successful deliveries.
    pub async fn redrive(&self) -> error_stack::Result<usize, DispatchError> {
        let intents = self
            .state
            .list_unresolved_intents()
            .await
            .change_context(DispatchError::State)?;
        let mut delivered = 0;
        for intent in intents {
            match self
                .dispatch(
                    intent.subject,
                    Some(&intent.callback),
                    &intent.result,
                    intent.context.as_ref(),
                )
                .await
            {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::error!(?error, subject = %intent.subject, "redelivery failed");
                }
            }
        }
        Ok(delivered)
    }
}
