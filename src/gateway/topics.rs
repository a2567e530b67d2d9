//! Topic to event-filter translation

use crate::events::{EventFilter, EventType};

/// Translate a subscription topic into an event filter
///
/// Known topics map to fixed type sets; `all` is unfiltered; any other
/// string must name an event type exactly.
pub fn filter_for_topic(topic: &str, user_id: &str) -> Result<EventFilter, String> {
    let filter = match topic {
        "container.status" => EventFilter::for_types(vec![
            EventType::ContainerStarted,
            EventType::ContainerStopped,
            EventType::ContainerUpdated,
            EventType::ContainerError,
            EventType::ContainerCreated,
            EventType::ContainerDeleted,
            EventType::ContainerRestarted,
        ]),
        // Until log streaming exists, only error output flows here.
        "container.logs" => EventFilter::for_types(vec![EventType::ContainerError]),
        "image.update" => EventFilter::for_types(vec![
            EventType::ImageUpdateAvailable,
            EventType::ImageUpdateStarted,
            EventType::ImageUpdateCompleted,
            EventType::ImageUpdateFailed,
        ]),
        "system.health" => EventFilter::for_types(vec![
            EventType::SystemHealthChanged,
            EventType::SystemResourceAlert,
        ]),
        "task.progress" => EventFilter::for_types(vec![
            EventType::TaskStarted,
            EventType::TaskCompleted,
            EventType::TaskFailed,
        ]),
        "user.notification" => EventFilter {
            types: vec![EventType::NotificationCreated],
            user_id: Some(user_id.to_string()),
            ..Default::default()
        },
        "all" => EventFilter::any(),
        other => {
            let event_type: EventType = other
                .parse()
                .map_err(|_| format!("unknown topic: {}", other))?;
            EventFilter::for_types(vec![event_type])
        }
    };
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, Severity};

    #[test]
    fn image_update_topic_matches_only_image_events() {
        let filter = filter_for_topic("image.update", "u1").unwrap();
        let hit = Event::new(
            EventType::ImageUpdateAvailable,
            Severity::Info,
            "image_check",
            "t",
            "m",
        );
        let miss = Event::new(
            EventType::ContainerStarted,
            Severity::Info,
            "orchestrator",
            "t",
            "m",
        );
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }

    #[test]
    fn user_notification_topic_is_user_scoped() {
        let filter = filter_for_topic("user.notification", "u1").unwrap();
        let event = Event::new(
            EventType::NotificationCreated,
            Severity::Info,
            "scheduler",
            "t",
            "m",
        );
        assert!(!filter.matches(&event));
        assert!(filter.matches(&event.clone().with_user("u1")));
        assert!(!filter.matches(&event.with_user("u2")));
    }

    #[test]
    fn all_topic_accepts_everything() {
        let filter = filter_for_topic("all", "u1").unwrap();
        let event = Event::new(EventType::TaskStarted, Severity::Debug, "scheduler", "t", "m");
        assert!(filter.matches(&event));
    }

    #[test]
    fn raw_event_type_topics_are_exact() {
        let filter = filter_for_topic("task.cancelled", "u1").unwrap();
        assert_eq!(filter.types, vec![EventType::TaskCancelled]);

        assert!(filter_for_topic("task.exploded", "u1").is_err());
    }
}
