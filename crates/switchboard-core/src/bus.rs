//! Synchronous filtered publish/subscribe.
//!
//! Handlers run inline on the publisher's thread, in registration
//! order. Delivery is at-most-once per live subscriber: no buffering,
//! no replay, no retry. Once closed, publishes become silent no-ops so
//! late producers cannot fail during teardown.
//!
//! ```rust,ignore
//! let bus = EventBus::new();
//! bus.subscribe_filtered(
//!     EventFilter::Kind(EventKind::DeviceOffline),
//!     Box::new(|event| println!("offline: {event:?}")),
//! );
//! bus.publish(&event);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::model::{Event, EventFilter};

/// Subscriber callback. Runs on the publisher's thread; must not block.
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    filter: EventFilter,
    handler: EventHandler,
}

/// Synchronous fan-out of [`Event`]s to filtered subscribers.
pub struct EventBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self, handler: EventHandler) {
        self.subscribe_filtered(EventFilter::All, handler);
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe_filtered(&self, filter: EventFilter, handler: EventHandler) {
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .push(Arc::new(Subscription { filter, handler }));
    }

    /// Deliver `event` to every matching subscriber, inline.
    ///
    /// The subscription list is snapshotted first, so handlers may
    /// publish or subscribe without deadlocking the bus.
    pub fn publish(&self, event: &Event) {
        if self.closed.load(Ordering::SeqCst) {
            trace!(?event, "bus closed, dropping event");
            return;
        }

        let snapshot: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .expect("subscription lock poisoned")
            .clone();

        for subscription in &snapshot {
            if subscription.filter.matches(event) {
                (subscription.handler)(event);
            }
        }
    }

    /// Close the bus. Subsequent publishes are no-ops and all
    /// subscriptions are dropped. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .clear();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
