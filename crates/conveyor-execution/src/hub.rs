use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use conveyor_core::TaskResult;
use conveyor_core::work::WorkId;
use tokio::sync::oneshot;

/// In-memory fanout of terminal work item results to awaiting tasks.
///
/// Purely a wakeup mechanism layered over the store: the durable record
/// is the source of truth, and subscribers that might have missed the
/// notification (restart, late subscription) re-check the store.
#[derive(Clone, Default)]
pub(crate) struct CompletionHub {
    waiters: Arc<Mutex<HashMap<WorkId, Vec<oneshot::Sender<TaskResult>>>>>,
}

impl CompletionHub {
    pub(crate) fn subscribe(&self, id: WorkId) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.entry(id).or_default().push(tx);
        rx
    }

    pub(crate) fn complete(&self, id: WorkId, result: &TaskResult) {
        let senders = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(&id)
        };
        if let Some(senders) = senders {
            for sender in senders {
                // Receivers may have been dropped; that is fine.
                let _ = sender.send(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_then_complete() {
        let hub = CompletionHub::default();
        let id = WorkId::new();

        let rx = hub.subscribe(id);
        hub.complete(id, &TaskResult::Canceled);
        assert_eq!(rx.await.unwrap(), TaskResult::Canceled);
    }

    #[tokio::test]
    async fn test_complete_without_subscribers_is_a_no_op() {
        let hub = CompletionHub::default();
        hub.complete(WorkId::new(), &TaskResult::Canceled);
    }
}
