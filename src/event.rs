use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

/// Boxed event handler. Each invocation receives the event payload and runs
/// on its own task.
pub type EventHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registration token returned by [`EventBus::on`], used for removal.
/// Closures have no usable identity, so subscriptions are tracked by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Multi-subscriber fan-out of named string events.
///
/// Emission snapshots the handler list under the topic lock, releases it,
/// then dispatches every handler on a fresh task without waiting for any of
/// them. Handlers added during an emit are not guaranteed to see the
/// in-flight event; removing a handler does not cancel an already-dispatched
/// invocation.
pub struct EventBus {
    topics: DashMap<&'static str, Vec<(HandlerId, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a handler to a topic. Insertion order is preserved.
    pub fn on<F, Fut>(&self, topic: &'static str, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: EventHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.topics.entry(topic).or_default().push((id, boxed));
        id
    }

    /// Remove the handler registered under `id`. Unknown ids are a no-op.
    pub fn off(&self, topic: &'static str, id: HandlerId) {
        if let Some(mut handlers) = self.topics.get_mut(topic) {
            handlers.retain(|(hid, _)| *hid != id);
        }
    }

    /// Deliver `payload` to every handler currently subscribed to `topic`.
    /// Returns immediately; handlers run concurrently on their own tasks.
    pub fn emit(&self, topic: &'static str, payload: &str) {
        let snapshot: Vec<EventHandler> = match self.topics.get(topic) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in snapshot {
            tokio::spawn(handler(payload.to_string()));
        }
    }

    /// Move every handler of `from` onto the end of `to`, preserving order
    /// and tokens. Used to merge handler queues installed before a link was
    /// live into the live topic.
    pub fn merge(&self, from: &'static str, to: &'static str) {
        let moved = match self.topics.remove(from) {
            Some((_, handlers)) => handlers,
            None => return,
        };
        self.topics.entry(to).or_default().extend(moved);
    }

    /// Number of handlers currently subscribed to `topic`.
    pub fn len(&self, topic: &'static str) -> usize {
        self.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
