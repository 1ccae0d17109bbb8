//! Subscription router.
//!
//! Delivers change notifications to per-kind subscribers and connection
//! events to connection subscribers. Notifications are queued by the store
//! while it holds its write lock and delivered after the lock is released,
//! so callbacks may read or write the store. A notification raised from
//! inside a callback is delivered after the current one finishes, which
//! keeps per-kind delivery in order.

use crate::supervisor::ConnectionState;
use fleetsync_protocol::EntityKind;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked for each delivered notification.
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// A live backend event.
    Event,
    /// A resync batch.
    Resync,
    /// A local optimistic mutation.
    Optimistic,
    /// A pending mutation was rolled back.
    Rollback,
}

/// A set of entities of one kind that changed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Kind of every changed entity.
    pub kind: EntityKind,
    /// Changed entity ids, in application order.
    pub ids: Vec<String>,
    /// What produced the change.
    pub cause: ChangeCause,
}

/// Connection lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// New state.
    pub state: ConnectionState,
    /// Failed attempts since the backend last served a session.
    pub consecutive_failures: u32,
    /// Set once per failure streak, when the reconnect budget is exhausted.
    pub persistent_failure: bool,
    /// Delay before the next attempt, when one is scheduled.
    pub retry_in: Option<Duration>,
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Entities changed.
    Changed(ChangeSet),
    /// Connection state changed.
    Connection(ConnectionEvent),
}

impl Notification {
    /// Creates a change notification.
    pub fn changed(kind: EntityKind, ids: Vec<String>, cause: ChangeCause) -> Self {
        Notification::Changed(ChangeSet { kind, ids, cause })
    }
}

#[derive(Default)]
struct Subscribers {
    by_kind: HashMap<EntityKind, Vec<(SubscriptionHandle, Callback)>>,
    connection: Vec<(SubscriptionHandle, Callback)>,
}

impl Subscribers {
    fn matching(&self, notification: &Notification) -> Vec<Callback> {
        let list = match notification {
            Notification::Changed(change) => match self.by_kind.get(&change.kind) {
                Some(list) => list,
                None => return Vec::new(),
            },
            Notification::Connection(_) => &self.connection,
        };
        list.iter().map(|(_, callback)| callback.clone()).collect()
    }
}

/// Routes notifications to subscribers.
pub struct SubscriptionRouter {
    subscribers: RwLock<Subscribers>,
    queue: Mutex<VecDeque<Notification>>,
    dispatching: AtomicBool,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("subscriptions", &self.subscription_count())
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl SubscriptionRouter {
    /// Creates a router with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Subscribers::default()),
            queue: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
        }
    }

    /// Registers a callback for changes to `kind`.
    pub fn subscribe<F>(&self, kind: EntityKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let handle = self.next_handle();
        self.subscribers
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push((handle, Arc::new(callback)));
        handle
    }

    /// Registers a callback for connection events.
    pub fn subscribe_connection<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let handle = self.next_handle();
        self.subscribers
            .write()
            .connection
            .push((handle, Arc::new(callback)));
        handle
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.connection.len();
        subscribers.connection.retain(|(h, _)| *h != handle);
        if subscribers.connection.len() != before {
            return true;
        }
        for list in subscribers.by_kind.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != handle);
            if list.len() != before {
                return true;
            }
        }
        false
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        let subscribers = self.subscribers.read();
        subscribers.connection.len() + subscribers.by_kind.values().map(Vec::len).sum::<usize>()
    }

    /// Notifications delivered to callbacks so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Queues a notification without delivering it.
    pub fn enqueue(&self, notification: Notification) {
        self.queue.lock().push_back(notification);
    }

    /// Queues a notification and delivers everything pending.
    pub fn publish(&self, notification: Notification) {
        self.enqueue(notification);
        self.dispatch();
    }

    /// Delivers queued notifications in order.
    ///
    /// If another call is already delivering (on this thread through a
    /// callback, or on another thread), returns at once and leaves the queue
    /// to that call.
    pub fn dispatch(&self) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            {
                let _guard = DispatchGuard(&self.dispatching);
                while let Some(notification) = self.next_queued() {
                    let callbacks = self.subscribers.read().matching(&notification);
                    for callback in callbacks {
                        callback(&notification);
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            // Something may have been queued between the last pop and the
            // flag reset.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn next_queued(&self) -> Option<Notification> {
        self.queue.lock().pop_front()
    }

    fn next_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
