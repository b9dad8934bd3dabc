//! Publish/subscribe dispatcher
//!
//! - Handlers are registered per [`EventKind`]; several per kind are allowed
//! - `publish` hands the event to every handler of its kind and of its
//!   supertype (if any), never to handlers of unrelated kinds
//! - Each invocation is isolated: a panicking handler is logged and the
//!   remaining handlers still run
//! - In [`DispatchMode::Pooled`] handlers run on tokio's blocking pool, so
//!   publishing from an I/O task never waits for a slow subscriber

use crate::events::event::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Handle;

/// A subscribed callback
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Where handlers are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// On the publisher's thread, before `publish` returns
    Inline,
    /// On the runtime's blocking pool; `publish` returns immediately
    #[default]
    Pooled,
}

/// Returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
}

struct BusInner {
    mode: DispatchMode,
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            inner: Arc::new(BusInner {
                mode,
                next_id: AtomicU64::new(0),
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.inner.mode
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.entry(kind).or_default().push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        handlers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Number of handlers registered for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn publish(&self, event: Event) {
        let targets = self.targets(&event);
        if targets.is_empty() {
            log::trace!("No subscribers for {:?}", event.kind());
            return;
        }

        let event = Arc::new(event);
        match (self.inner.mode, Handle::try_current()) {
            (DispatchMode::Pooled, Ok(runtime)) => {
                for handler in targets {
                    let event = Arc::clone(&event);
                    runtime.spawn_blocking(move || invoke(&handler, &event));
                }
            }
            _ => {
                for handler in &targets {
                    invoke(handler, &event);
                }
            }
        }
    }

    // Snapshot of the handlers for this event, so none are invoked under the lock
    fn targets(&self, event: &Event) -> Vec<EventHandler> {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut targets = Vec::new();
        for kind in std::iter::once(event.kind()).chain(event.supertype()) {
            if let Some(subs) = handlers.get(&kind) {
                targets.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
            }
        }
        targets
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DispatchMode::default())
    }
}

fn invoke(handler: &EventHandler, event: &Event) {
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        log::error!("Event handler panicked while handling {:?}", event.kind());
    }
}
