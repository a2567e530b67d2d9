//! Maintenance windows gating automatic updates

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::resolve_timezone;

/// A recurring time window in a local timezone
///
/// `end_time < start_time` wraps past midnight. `days_of_week` uses
/// 0 = Sunday. The timezone falls back to UTC when the name is unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    /// "HH:MM"
    pub start_time: String,
    /// "HH:MM"
    pub end_time: String,
    /// 0 = Sunday .. 6 = Saturday; empty = every day
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl MaintenanceWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (
            parse_hhmm(&self.start_time),
            parse_hhmm(&self.end_time),
        ) else {
            return false;
        };

        let tz = resolve_timezone(&self.timezone);
        let local = now.with_timezone(&tz);
        let minutes = local.hour() * 60 + local.minute();
        let day = local.weekday().num_days_from_sunday() as u8;
        let prev_day = (day + 6) % 7;

        let day_allowed = |d: u8| self.days_of_week.is_empty() || self.days_of_week.contains(&d);

        if start <= end {
            minutes >= start && minutes < end && day_allowed(day)
        } else {
            // Wrapped window: the early-morning half belongs to the day the
            // window opened on.
            (minutes >= start && day_allowed(day)) || (minutes < end && day_allowed(prev_day))
        }
    }
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Whether any window admits `now`; an empty list means "always"
pub fn within_any(windows: &[MaintenanceWindow], now: DateTime<Utc>) -> bool {
    windows.is_empty() || windows.iter().any(|w| w.contains(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(start: &str, end: &str) -> MaintenanceWindow {
        MaintenanceWindow {
            start_time: start.into(),
            end_time: end.into(),
            days_of_week: vec![0, 1, 2, 3, 4, 5, 6],
            timezone: "UTC".into(),
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        // A Wednesday.
        Utc.with_ymd_and_hms(2024, 3, 13, hour, minute, 0).unwrap()
    }

    #[test]
    fn wrapped_window_spans_midnight() {
        let w = window("22:00", "06:00");
        assert!(w.contains(at(23, 0)));
        assert!(w.contains(at(5, 0)));
        assert!(!w.contains(at(7, 0)));
        assert!(!w.contains(at(12, 0)));
    }

    #[test]
    fn plain_window_bounds() {
        let w = window("09:00", "17:00");
        assert!(w.contains(at(9, 0)));
        assert!(w.contains(at(12, 30)));
        assert!(!w.contains(at(17, 0)));
        assert!(!w.contains(at(8, 59)));
    }

    #[test]
    fn day_restriction_applies() {
        let mut w = window("00:00", "23:59");
        // Sunday only; 2024-03-13 is a Wednesday.
        w.days_of_week = vec![0];
        assert!(!w.contains(at(12, 0)));

        w.days_of_week = vec![3];
        assert!(w.contains(at(12, 0)));
    }

    #[test]
    fn empty_window_list_admits_everything() {
        assert!(within_any(&[], at(3, 0)));
        assert!(!within_any(&[window("09:00", "10:00")], at(3, 0)));
    }

    #[test]
    fn timezone_shifts_the_window() {
        let mut w = window("22:00", "23:00");
        w.timezone = "Europe/Berlin".into();
        // 21:30 UTC in March is 22:30 in Berlin (CET+1).
        assert!(w.contains(at(21, 30)));
        assert!(!w.contains(at(22, 30)));
    }

    #[test]
    fn malformed_times_never_match() {
        let w = window("25:00", "06:00");
        assert!(!w.contains(at(3, 0)));
    }
}
