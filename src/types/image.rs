//! Persisted image version cache rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached view of a registry artifact
///
/// Uniqueness key is `(image_name, tag, registry_url)`. Invariant: at most
/// one row per `(image_name, registry_url)` carries `is_latest = true`;
/// marking a row latest clears the others in the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageVersion {
    pub image_name: String,
    pub tag: String,
    pub registry_url: String,

    /// Content-addressable manifest digest
    pub digest: String,

    pub size_bytes: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    pub architecture: Option<String>,
    pub os: Option<String>,

    /// Free-form metadata (scan results, last error, registry extras)
    pub metadata: serde_json::Value,

    /// When the registry was last queried for this row
    pub checked_at: DateTime<Utc>,

    pub is_latest: bool,
}

impl ImageVersion {
    /// Whether the cached row is older than `max_age_hours`
    pub fn is_stale(&self, max_age_hours: u64, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.checked_at);
        age.num_hours() >= max_age_hours as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(checked_at: DateTime<Utc>) -> ImageVersion {
        ImageVersion {
            image_name: "library/nginx".into(),
            tag: "1.24".into(),
            registry_url: "docker.io".into(),
            digest: "sha256:aaa".into(),
            size_bytes: None,
            published_at: None,
            architecture: None,
            os: None,
            metadata: serde_json::Value::Null,
            checked_at,
            is_latest: true,
        }
    }

    #[test]
    fn staleness_uses_checked_at() {
        let now = Utc::now();
        assert!(!row(now).is_stale(6, now));
        assert!(row(now - Duration::hours(7)).is_stale(6, now));
    }
}
