//! Subscriber channels (`data`, `open`, `error`) for a session.

use crate::error::SessionError;
use serde_json::Value;
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError, Weak},
};
use tracing::error;

/// Names of the subscriber channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Open,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Data => "data",
            EventKind::Open => "open",
            EventKind::Error => "error",
        })
    }
}

/// Payload delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A parsed inbound message.
    Data(Value),
    /// The transport reached `Open`.
    Open,
    Error(SessionError),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Data(_) => EventKind::Data,
            SessionEvent::Open => EventKind::Open,
            SessionEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Slots {
    next_id: u64,
    entries: Vec<(u64, EventKind, Handler)>,
}

/// Ordered handler list shared between the session and its subscriptions.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Mutex<Slots>,
}

impl Registry {
    pub(crate) fn subscribe(self: &Arc<Self>, kind: EventKind, handler: Handler) -> Subscription {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.next_id += 1;
        let id = slots.next_id;
        slots.entries.push((id, kind, handler));
        Subscription {
            id,
            kind,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.entries.len();
        slots.entries.retain(|(entry_id, _, _)| *entry_id != id);
        slots.entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Delivers `event` to every handler of its kind in registration order.
    ///
    /// Handlers run outside the lock, so they may subscribe or unsubscribe.
    /// A panicking handler is logged and skipped.
    pub(crate) fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        let handlers: Vec<(u64, Handler)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .entries
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(id, _, handler)| (*id, handler.clone()))
                .collect()
        };

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(subscription = id, event = %kind, "Subscriber panicked; continuing delivery");
            }
        }
    }
}

/// Handle returned by [`Session::on`](crate::session::Session::on).
///
/// Dropping the handle keeps the handler registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes the handler. Returns `false` if it was already gone (for
    /// instance because `connect` cleared all subscribers).
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}
