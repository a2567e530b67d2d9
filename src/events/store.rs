//! Event persistence hook and the default in-memory store

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::types::{Event, EventFilter};

/// Receives every event published on a bus
///
/// Implementations must not block: `persist` runs on the publisher's path.
pub trait EventStore: Send + Sync {
    fn persist(&self, event: &Event);

    /// Most recent stored events matching the filter, newest first
    fn recent(&self, filter: &EventFilter, limit: usize) -> Vec<Event>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map-backed store keyed by event id with timestamp-ordered eviction
///
/// When the store grows past its maximum it drops at least 10% of the
/// oldest events in one sweep so eviction cost amortises.
pub struct InMemoryEventStore {
    max_events: usize,
    events: Mutex<HashMap<String, Event>>,
}

impl InMemoryEventStore {
    /// Default capacity used when none is configured
    pub const DEFAULT_MAX_EVENTS: usize = 10_000;

    pub fn new(max_events: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            events: Mutex::new(HashMap::new()),
        }
    }

    fn evict_locked(events: &mut HashMap<String, Event>, max_events: usize) {
        if events.len() <= max_events {
            return;
        }

        let to_drop = (events.len() - max_events).max(max_events / 10).max(1);

        let mut by_age: Vec<(String, chrono::DateTime<chrono::Utc>)> = events
            .iter()
            .map(|(id, e)| (id.clone(), e.timestamp))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);

        for (id, _) in by_age.into_iter().take(to_drop) {
            events.remove(&id);
        }
        debug!("Evicted {} events from the in-memory store", to_drop);
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_EVENTS)
    }
}

impl EventStore for InMemoryEventStore {
    fn persist(&self, event: &Event) {
        let mut events = self.events.lock();
        events.insert(event.id.clone(), event.clone());
        Self::evict_locked(&mut events, self.max_events);
    }

    fn recent(&self, filter: &EventFilter, limit: usize) -> Vec<Event> {
        let events = self.events.lock();
        let mut matching: Vec<Event> = events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        matching
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{EventType, Severity};
    use super::*;

    fn event() -> Event {
        Event::new(EventType::TaskStarted, Severity::Info, "test", "t", "m")
    }

    #[test]
    fn persist_is_idempotent_by_id() {
        let store = InMemoryEventStore::new(100);
        let e = event();
        store.persist(&e);
        store.persist(&e);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn eviction_drops_oldest_tenth() {
        let store = InMemoryEventStore::new(100);
        for _ in 0..101 {
            store.persist(&event());
        }
        // One over capacity: a 10% sweep leaves 91 behind.
        assert_eq!(store.len(), 91);
    }

    #[test]
    fn recent_filters_and_orders() {
        let store = InMemoryEventStore::new(100);
        store.persist(&event());
        let err = Event::new(EventType::TaskFailed, Severity::Error, "test", "t", "m");
        store.persist(&err);

        let filter = EventFilter {
            severities: vec![Severity::Error],
            ..Default::default()
        };
        let found = store.recent(&filter, 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_type, EventType::TaskFailed);
    }
}
