//! Event and filter types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of event types flowing through the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "container.created")]
    ContainerCreated,
    #[serde(rename = "container.started")]
    ContainerStarted,
    #[serde(rename = "container.stopped")]
    ContainerStopped,
    #[serde(rename = "container.restarted")]
    ContainerRestarted,
    #[serde(rename = "container.updated")]
    ContainerUpdated,
    #[serde(rename = "container.deleted")]
    ContainerDeleted,
    #[serde(rename = "container.error")]
    ContainerError,

    #[serde(rename = "image.update_available")]
    ImageUpdateAvailable,
    #[serde(rename = "image.update_started")]
    ImageUpdateStarted,
    #[serde(rename = "image.update_completed")]
    ImageUpdateCompleted,
    #[serde(rename = "image.update_failed")]
    ImageUpdateFailed,

    #[serde(rename = "system.startup")]
    SystemStartup,
    #[serde(rename = "system.shutdown")]
    SystemShutdown,
    #[serde(rename = "system.health_changed")]
    SystemHealthChanged,
    #[serde(rename = "system.resource_alert")]
    SystemResourceAlert,
    #[serde(rename = "system.error")]
    SystemError,

    #[serde(rename = "user.logged_in")]
    UserLoggedIn,
    #[serde(rename = "user.logged_out")]
    UserLoggedOut,

    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.timeout")]
    TaskTimeout,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,

    #[serde(rename = "notification.created")]
    NotificationCreated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ContainerCreated => "container.created",
            EventType::ContainerStarted => "container.started",
            EventType::ContainerStopped => "container.stopped",
            EventType::ContainerRestarted => "container.restarted",
            EventType::ContainerUpdated => "container.updated",
            EventType::ContainerDeleted => "container.deleted",
            EventType::ContainerError => "container.error",
            EventType::ImageUpdateAvailable => "image.update_available",
            EventType::ImageUpdateStarted => "image.update_started",
            EventType::ImageUpdateCompleted => "image.update_completed",
            EventType::ImageUpdateFailed => "image.update_failed",
            EventType::SystemStartup => "system.startup",
            EventType::SystemShutdown => "system.shutdown",
            EventType::SystemHealthChanged => "system.health_changed",
            EventType::SystemResourceAlert => "system.resource_alert",
            EventType::SystemError => "system.error",
            EventType::UserLoggedIn => "user.logged_in",
            EventType::UserLoggedOut => "user.logged_out",
            EventType::TaskStarted => "task.started",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::TaskTimeout => "task.timeout",
            EventType::TaskCancelled => "task.cancelled",
            EventType::NotificationCreated => "notification.created",
        }
    }

    pub fn all() -> &'static [EventType] {
        &[
            EventType::ContainerCreated,
            EventType::ContainerStarted,
            EventType::ContainerStopped,
            EventType::ContainerRestarted,
            EventType::ContainerUpdated,
            EventType::ContainerDeleted,
            EventType::ContainerError,
            EventType::ImageUpdateAvailable,
            EventType::ImageUpdateStarted,
            EventType::ImageUpdateCompleted,
            EventType::ImageUpdateFailed,
            EventType::SystemStartup,
            EventType::SystemShutdown,
            EventType::SystemHealthChanged,
            EventType::SystemResourceAlert,
            EventType::SystemError,
            EventType::UserLoggedIn,
            EventType::UserLoggedOut,
            EventType::TaskStarted,
            EventType::TaskCompleted,
            EventType::TaskFailed,
            EventType::TaskTimeout,
            EventType::TaskCancelled,
            EventType::NotificationCreated,
        ]
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Success => "success",
            Severity::Debug => "debug",
        };
        write!(f, "{}", s)
    }
}

/// An event published on the bus, immutable once published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub severity: Severity,

    /// Subsystem that emitted the event
    pub source: String,

    pub user_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,

    pub title: String,
    pub message: String,

    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            severity,
            source: source.into(),
            user_id: None,
            resource_type: None,
            resource_id: None,
            title: title.into(),
            message: message.into(),
            data: serde_json::Map::new(),
            tags: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Conjunction of predicates over event fields; empty predicates accept
/// anything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub types: Vec<EventType>,
    #[serde(default)]
    pub severities: Vec<Severity>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub user_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Every filter tag must be present on the event
    #[serde(default)]
    pub tags: Vec<String>,
    /// Inclusive time window
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Filter that accepts every event
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_types(types: Vec<EventType>) -> Self {
        Self {
            types,
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&event.severity) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            match &event.user_id {
                Some(event_user) if event_user == user_id => {}
                _ => return false,
            }
        }
        if let Some(resource_type) = &self.resource_type {
            if event.resource_type.as_deref() != Some(resource_type.as_str()) {
                return false;
            }
        }
        if let Some(resource_id) = &self.resource_id {
            if event.resource_id.as_deref() != Some(resource_id.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().all(|t| event.tags.contains(t)) {
            return false;
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event::new(
            EventType::ContainerStarted,
            Severity::Info,
            "orchestrator",
            "Container started",
            "web started",
        )
        .with_resource("container", "web")
        .with_tags(vec!["prod".into(), "west".into()])
    }

    #[test]
    fn empty_filter_accepts_anything() {
        assert!(EventFilter::any().matches(&sample()));
    }

    #[test]
    fn type_and_tag_conjunction() {
        let filter = EventFilter {
            types: vec![EventType::ContainerStarted],
            tags: vec!["prod".into()],
            ..Default::default()
        };
        assert!(filter.matches(&sample()));

        let mut event = sample();
        event.tags = vec!["west".into()];
        assert!(!filter.matches(&event));
    }

    #[test]
    fn user_filter_requires_presence_and_equality() {
        let filter = EventFilter {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&sample()));
        assert!(filter.matches(&sample().with_user("u1")));
        assert!(!filter.matches(&sample().with_user("u2")));
    }

    #[test]
    fn time_window_bounds_are_inclusive() {
        let event = sample();
        let filter = EventFilter {
            since: Some(event.timestamp),
            until: Some(event.timestamp),
            ..Default::default()
        };
        assert!(filter.matches(&event));
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let event = sample().with_user("u1").with_data(
            "digest",
            serde_json::Value::String("sha256:abc".into()),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);

        // Absent option fields serialise as nulls and come back as None.
        let plain = sample();
        let json = serde_json::to_string(&plain).unwrap();
        assert!(json.contains("\"user_id\":null"));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(plain, back);
    }

    #[test]
    fn event_type_str_round_trip() {
        for t in EventType::all() {
            let parsed: EventType = t.as_str().parse().unwrap();
            assert_eq!(parsed, *t);
        }
        assert!("container.exploded".parse::<EventType>().is_err());
    }
}
