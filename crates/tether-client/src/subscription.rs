//! Buffer subscriptions for daemon `edit-buffer` pushes.
//!
//! Tracks which callbacks want edits for which buffers. Callbacks for one
//! buffer fire in registration order, and every registration is independent:
//! registering the same closure twice delivers each edit twice.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_protocol::{BufferEdit, BufferId};
use tracing::{debug, error, trace};

/// Callback invoked with `(op, data)` of each edit pushed for a buffer.
pub type BufferCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Identifier of a single registration.
///
/// Unique within a registry and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw numeric value, as shown in `sub-N`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Default)]
struct Subscribers {
    by_buffer: HashMap<BufferId, Vec<(SubscriptionId, BufferCallback)>>,
    closed: bool,
}

/// Per-session map from buffer id to its ordered subscribers.
///
/// Once `close` has run (the session ended) the registry stays empty: later
/// registrations are dropped on the spot, so whatever the callback owns
/// (a channel sender, for instance) is released immediately.
///
/// # Example
///
/// ```
/// use serde_json::{json, Value};
/// use std::sync::Arc;
/// use tether_client::{BufferEdit, BufferId, BufferRegistry};
///
/// let registry = BufferRegistry::new();
/// let id = registry.subscribe(
///     BufferId::from("buf1"),
///     Arc::new(|op: &str, data: &Value| println!("{} {}", op, data)),
/// );
///
/// let edit = BufferEdit {
///     id: "buf1".into(),
///     op: "insert".into(),
///     data: json!("x"),
/// };
/// assert_eq!(registry.deliver(&edit), 1);
///
/// // Closing drops every subscription
/// registry.close();
/// assert_eq!(registry.deliver(&edit), 0);
/// assert!(!registry.unsubscribe(&"buf1".into(), id));
/// ```
pub struct BufferRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Subscribers>,
}

impl BufferRegistry {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Subscribers::default()),
        }
    }

    /// Append `callback` to the subscribers of `buffer`.
    ///
    /// On a closed registry the callback is dropped instead of stored; the
    /// returned id is still unique but refers to nothing.
    pub fn subscribe(&self, buffer: BufferId, callback: BufferCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.write();
        if subs.closed {
            debug!(buffer = %buffer, subscription = %id, "Registry closed, dropping subscription");
            return id;
        }
        debug!(buffer = %buffer, subscription = %id, "Subscribing to buffer");
        subs.by_buffer.entry(buffer).or_default().push((id, callback));
        id
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, buffer: &BufferId, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let Some(callbacks) = subs.by_buffer.get_mut(buffer) else {
            return false;
        };

        let before = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != id);
        let removed = callbacks.len() != before;

        // Clean up empty entries
        if callbacks.is_empty() {
            subs.by_buffer.remove(buffer);
        }

        if removed {
            debug!(buffer = %buffer, subscription = %id, "Unsubscribed from buffer");
        }
        removed
    }

    /// Snapshot of the callbacks for `buffer`, in registration order.
    pub fn subscribers(&self, buffer: &BufferId) -> Vec<BufferCallback> {
        self.subscribers
            .read()
            .by_buffer
            .get(buffer)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Number of live registrations for `buffer`.
    pub fn subscriber_count(&self, buffer: &BufferId) -> usize {
        self.subscribers
            .read()
            .by_buffer
            .get(buffer)
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }

    /// Number of buffers with at least one subscriber.
    pub fn buffer_count(&self) -> usize {
        self.subscribers.read().by_buffer.len()
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.subscribers.read().closed
    }

    /// Deliver an edit to the subscribers of its buffer.
    ///
    /// Callbacks run outside the lock, so they may subscribe or unsubscribe;
    /// such changes apply from the next edit on. A panicking callback stops
    /// delivery of this edit to the callbacks after it.
    ///
    /// Returns the number of callbacks that completed.
    pub fn deliver(&self, edit: &BufferEdit) -> usize {
        let callbacks = self.subscribers(&edit.id);
        if callbacks.is_empty() {
            trace!(buffer = %edit.id, op = %edit.op, "No subscribers for buffer edit");
            return 0;
        }

        let mut delivered = 0;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            for callback in &callbacks {
                callback(&edit.op, &edit.data);
                delivered += 1;
            }
        }));

        if outcome.is_err() {
            error!(
                buffer = %edit.id,
                op = %edit.op,
                delivered,
                skipped = callbacks.len() - delivered - 1,
                "Buffer subscriber panicked, remaining subscribers skipped"
            );
        }
        delivered
    }

    /// Drop every subscription and refuse new ones (session ended).
    pub fn close(&self) {
        let drained = {
            let mut subs = self.subscribers.write();
            subs.closed = true;
            std::mem::take(&mut subs.by_buffer)
        };
        if !drained.is_empty() {
            debug!(buffers = drained.len(), "Cleared buffer subscriptions");
        }
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one buffer registration.
///
/// Dropping the handle keeps the subscription; call `unsubscribe` to stop
/// receiving edits.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    buffer: BufferId,
    registry: Weak<BufferRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, buffer: BufferId, registry: &Arc<BufferRegistry>) -> Self {
        Self {
            id,
            buffer,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn buffer(&self) -> &BufferId {
        &self.buffer
    }

    /// Stop delivery to this registration.
    ///
    /// Returns false if it was already removed (or the session is gone).
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.unsubscribe(&self.buffer, self.id))
            .unwrap_or(false)
    }
}
