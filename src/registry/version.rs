//! Update-type classification between two tags

use std::sync::OnceLock;

use regex::Regex;

use super::types::UpdateType;

fn semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap())
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4}-\d{2}-\d{2}|\d{8})$").unwrap())
}

/// Classify how `latest` relates to `current`
///
/// A leading `v` is stripped from both tags. Semver triplets compare
/// componentwise; date-shaped tags (`YYYY-MM-DD` or `YYYYMMDD`) compare
/// lexicographically and a strictly greater latest counts as a minor
/// update. Anything else is unknown.
pub fn classify_update(current: &str, latest: &str) -> UpdateType {
    let current = current.strip_prefix('v').unwrap_or(current);
    let latest = latest.strip_prefix('v').unwrap_or(latest);

    if semver_re().is_match(current) && semver_re().is_match(latest) {
        let cur = parse_triplet(current);
        let new = parse_triplet(latest);
        return if cur.0 != new.0 {
            UpdateType::Major
        } else if cur.1 != new.1 {
            UpdateType::Minor
        } else {
            UpdateType::Patch
        };
    }

    if date_re().is_match(current) && date_re().is_match(latest) && latest > current {
        return UpdateType::Minor;
    }

    UpdateType::Unknown
}

fn parse_triplet(s: &str) -> (u64, u64, u64) {
    let mut parts = s.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_classification() {
        assert_eq!(classify_update("v1.2.3", "v1.3.0"), UpdateType::Minor);
        assert_eq!(classify_update("v1.2.3", "v2.0.0"), UpdateType::Major);
        assert_eq!(classify_update("1.2.3", "1.2.4"), UpdateType::Patch);
        assert_eq!(classify_update("v1.2.3", "1.2.4"), UpdateType::Patch);
    }

    #[test]
    fn date_classification() {
        assert_eq!(classify_update("2024-01-15", "2024-02-01"), UpdateType::Minor);
        assert_eq!(classify_update("20240115", "20240201"), UpdateType::Minor);
        assert_eq!(classify_update("2024-02-01", "2024-01-15"), UpdateType::Unknown);
    }

    #[test]
    fn mixed_forms_are_unknown() {
        assert_eq!(classify_update("v1.2.3", "sha-abc"), UpdateType::Unknown);
        assert_eq!(classify_update("latest", "1.2.3"), UpdateType::Unknown);
        assert_eq!(classify_update("2024-01-15", "1.2.3"), UpdateType::Unknown);
    }
}
