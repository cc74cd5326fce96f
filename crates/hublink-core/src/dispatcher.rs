//! In-process fan-out of inbound messages to registered consumers.
//!
//! Consumers are kept in registration order and removed by the id handed
//! out at registration, so two registrations of the same callback are
//! independently removable. Each callback runs in isolation: a returned
//! error or a panic is logged and the remaining callbacks still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::HandlerError;

/// A consumer callback.
pub type MessageHandler = Arc<dyn Fn(&Value) -> Result<(), HandlerError> + Send + Sync>;

/// Registration id, unique per dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<(SubscriptionId, MessageHandler)>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Ordered registry of consumer callbacks.
#[derive(Clone, Default)]
pub struct MessageDispatcher {
    registry: Arc<Registry>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. The returned handle removes exactly this entry.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(handler))
    }

    /// Register an already shared callback; the same `Arc` may be registered
    /// any number of times.
    pub fn subscribe_arc(&self, handler: MessageHandler) -> Subscription {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.entries.lock().unwrap().push((id, handler));
        tracing::debug!(subscription = %id, "consumer subscribed");
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register a channel-backed consumer. Messages are forwarded to the
    /// receiver until it is dropped or the subscription is removed.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(move |payload| {
            tx.send(payload.clone())
                .map_err(|_| HandlerError::from("receiver dropped"))
        });
        (sub, rx)
    }

    /// Deliver `payload` to every callback registered when the call starts,
    /// in registration order. Returns the number of callbacks that failed.
    pub fn dispatch(&self, payload: &Value) -> usize {
        let snapshot: Vec<(SubscriptionId, MessageHandler)> =
            self.registry.entries.lock().unwrap().clone();

        let mut failures = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::error!(subscription = %id, error = %e, "message handler failed");
                }
                Err(panic) => {
                    failures += 1;
                    tracing::error!(
                        subscription = %id,
                        panic = panic_message(&*panic),
                        "message handler panicked"
                    );
                }
            }
        }
        failures
    }

    /// Remove every subscription. Meant for full teardown only.
    pub fn clear(&self) {
        let removed = {
            let mut entries = self.registry.entries.lock().unwrap();
            let n = entries.len();
            entries.clear();
            n
        };
        tracing::debug!(removed, "dispatcher cleared");
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.registry.entries.lock().unwrap().len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("subscriptions", &self.len())
            .finish()
    }
}

/// Handle returned by [`MessageDispatcher::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe). Unsubscribing more than once is a no-op.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove this subscription. Returns `true` if it was still registered.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry.remove(self.id);
        if removed {
            tracing::debug!(subscription = %self.id, "consumer unsubscribed");
        }
        removed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
