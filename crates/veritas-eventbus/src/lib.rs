//! C5 Event Bus: per-task fan-out of live agent events to an unbounded set
//! of subscribers, each bounded independently so one slow subscriber never
//! blocks the publisher or starves its peers.
//!
//! Deliberately not `tokio::sync::broadcast`: broadcast shares one ring
//! buffer across all subscribers, so a slow subscriber lags every other
//! subscriber (or the whole channel closes under `RecvError::Lagged`).
//! The core needs drop-to-one-subscriber-only semantics, so each
//! subscription gets its own bounded `mpsc` channel instead.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use veritas_types::BusEvent;

/// Channel capacity for a single subscriber. Chosen generously above the
/// spec's floor of 64 so a brief consumer stall doesn't drop output under
/// normal load.
pub const SUBSCRIBER_CAPACITY: usize = 128;

type TaskId = String;

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<BusEvent>,
}

#[derive(Default)]
struct Registry {
    by_task: HashMap<TaskId, Vec<Subscriber>>,
}

/// Cheaply `Clone`able handle shared between the supervisor and whatever
/// subscribes on behalf of live connections.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    /// Registers a new subscriber for `task_id`. Returns a receiver and a
    /// handle that unsubscribes when dropped, so a disconnected client
    /// cleans itself out of the registry without an explicit call.
    pub async fn subscribe(&self, task_id: impl Into<String>) -> (mpsc::Receiver<BusEvent>, Subscription) {
        let task_id = task_id.into();
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);

        let mut registry = self.registry.write().await;
        registry
            .by_task
            .entry(task_id.clone())
            .or_default()
            .push(Subscriber { id, sender: tx });

        let subscription = Subscription {
            bus: self.clone(),
            task_id,
            id,
        };
        (rx, subscription)
    }

    pub async fn unsubscribe(&self, task_id: &str, id: Uuid) {
        let mut registry = self.registry.write().await;
        if let Some(subs) = registry.by_task.get_mut(task_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                registry.by_task.remove(task_id);
            }
        }
    }

    /// Delivers `event` to every current subscriber of `task_id`. A
    /// subscriber whose channel is full has the message dropped for it
    /// only; publish itself never blocks or fails.
    pub async fn publish(&self, task_id: &str, event: BusEvent) {
        let registry = self.registry.read().await;
        let Some(subs) = registry.by_task.get(task_id) else {
            return;
        };
        for sub in subs {
            if sub.sender.try_send(event.clone()).is_err() {
                tracing::debug!(task_id, subscriber = %sub.id, "dropping event, subscriber channel full or closed");
            }
        }
    }

    pub async fn subscriber_count(&self, task_id: &str) -> usize {
        self.registry
            .read()
            .await
            .by_task
            .get(task_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Drop guard returned from `subscribe`. Dropping it removes the
/// subscriber from the registry; `cancel` does the same eagerly.
pub struct Subscription {
    bus: EventBus,
    task_id: TaskId,
    id: Uuid,
}

impl Subscription {
    pub fn cancel(self) {
        // drop runs the cleanup
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let task_id = self.task_id.clone();
        let id = self.id;
        tokio::spawn(async move {
            bus.unsubscribe(&task_id, id).await;
        });
    }
}
