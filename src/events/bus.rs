//! Event bus for pub/sub messaging
//!
//! In-process publish/subscribe filtered per subscription. Publishing never
//! blocks: delivery to each matching subscription is a non-blocking send,
//! and a full subscription channel drops the event for that subscription
//! only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::EventStore;
use super::types::{Event, EventFilter};

/// Capacity of each subscription's delivery channel
pub const SUBSCRIPTION_CAPACITY: usize = 100;

/// A subscription handed to a consumer
///
/// Owned by whoever subscribed; dropping it (or the containing session)
/// ends delivery. The receiver side is the consumer's to drain.
pub struct Subscription {
    pub id: String,
    pub user_id: Option<String>,
    pub filter: EventFilter,
    pub created: DateTime<Utc>,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receive the next matching event; `None` once the bus side is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

struct SubscriptionHandle {
    user_id: Option<String>,
    filter: EventFilter,
    sender: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

struct BusInner {
    subscriptions: RwLock<HashMap<String, Arc<SubscriptionHandle>>>,
    store: Option<Arc<dyn EventStore>>,
    dropped_total: AtomicU64,
    closed: AtomicBool,
}

/// Event bus for broadcasting filtered events to subscribers
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(HashMap::new()),
                store: None,
                dropped_total: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a bus that also hands every published event to a store
    pub fn with_store(store: Arc<dyn EventStore>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(HashMap::new()),
                store: Some(store),
                dropped_total: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish an event to all matching subscriptions
    ///
    /// Returns the number of subscriptions the event was delivered to.
    /// Never blocks: full channels count as drops, not as waits.
    pub fn publish(&self, event: Event) -> usize {
        if self.inner.closed.load(Ordering::SeqCst) {
            return 0;
        }

        if let Some(store) = &self.inner.store {
            store.persist(&event);
        }

        let mut delivered = 0;
        let mut dead: Vec<String> = Vec::new();

        {
            let subscriptions = self.inner.subscriptions.read();
            for (id, handle) in subscriptions.iter() {
                if !handle.filter.matches(&event) {
                    continue;
                }
                match handle.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        handle.dropped.fetch_add(1, Ordering::Relaxed);
                        self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Dropped event {} for slow subscription {}",
                            event.event_type, id
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(id.clone());
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subscriptions = self.inner.subscriptions.write();
            for id in dead {
                subscriptions.remove(&id);
            }
        }

        delivered
    }

    /// Subscribe with a filter
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_inner(filter, None)
    }

    /// Subscribe on behalf of a user
    pub fn subscribe_with_user(&self, filter: EventFilter, user_id: impl Into<String>) -> Subscription {
        self.subscribe_inner(filter, Some(user_id.into()))
    }

    fn subscribe_inner(&self, filter: EventFilter, user_id: Option<String>) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        let handle = Arc::new(SubscriptionHandle {
            user_id: user_id.clone(),
            filter: filter.clone(),
            sender,
            dropped: AtomicU64::new(0),
        });
        self.inner.subscriptions.write().insert(id.clone(), handle);
        debug!("Subscription {} created", id);

        Subscription {
            id,
            user_id,
            filter,
            created: Utc::now(),
            receiver,
        }
    }

    /// Remove a subscription; delivery to it stops immediately
    pub fn unsubscribe(&self, subscription_id: &str) {
        if self.inner.subscriptions.write().remove(subscription_id).is_some() {
            debug!("Subscription {} removed", subscription_id);
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Total events dropped across all subscriptions since startup
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Events dropped for one subscription
    pub fn dropped_for(&self, subscription_id: &str) -> Option<u64> {
        self.inner
            .subscriptions
            .read()
            .get(subscription_id)
            .map(|h| h.dropped.load(Ordering::Relaxed))
    }

    /// The store attached to this bus, if any
    pub fn store(&self) -> Option<&Arc<dyn EventStore>> {
        self.inner.store.as_ref()
    }

    /// Subscriptions held for a given user
    pub fn subscriptions_for_user(&self, user_id: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .values()
            .filter(|h| h.user_id.as_deref() == Some(user_id))
            .count()
    }

    /// Close the bus: drop all subscriptions and refuse further publishes
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscriptions.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
