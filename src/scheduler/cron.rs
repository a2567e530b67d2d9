//! Cron expression parsing and next-run computation
//!
//! Accepts five-field classic expressions (minute, hour, day-of-month,
//! month, day-of-week) plus the `@hourly`-style descriptors. Evaluation is
//! timezone-aware; results come back in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid cron expression {expr:?}: {reason}")]
    Invalid { expr: String, reason: String },
}

/// A parsed, validated cron schedule
#[derive(Debug, Clone)]
pub struct CronSchedule {
    source: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse a five-field expression or descriptor
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(CronError::Invalid {
                expr: expr.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        let normalised = if let Some(descriptor) = expr.strip_prefix('@') {
            match descriptor {
                "hourly" => "0 0 * * * *".to_string(),
                "daily" | "midnight" => "0 0 0 * * *".to_string(),
                "weekly" => "0 0 0 * * Sun".to_string(),
                "monthly" => "0 0 0 1 * *".to_string(),
                "yearly" | "annually" => "0 0 0 1 1 *".to_string(),
                other => {
                    return Err(CronError::Invalid {
                        expr: expr.to_string(),
                        reason: format!("unknown descriptor @{}", other),
                    })
                }
            }
        } else {
            let fields: Vec<&str> = expr.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(CronError::Invalid {
                    expr: expr.to_string(),
                    reason: format!("expected 5 fields, got {}", fields.len()),
                });
            }
            validate_field_ranges(expr, &fields)?;
            // The schedule library wants a seconds field up front, and its
            // weekday ordinals differ from classic cron's 0=Sunday, so
            // numeric weekdays become names.
            format!(
                "0 {} {} {} {} {}",
                fields[0],
                fields[1],
                fields[2],
                fields[3],
                normalise_dow(fields[4])
            )
        };

        let schedule = Schedule::from_str(&normalised).map_err(|e| CronError::Invalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: expr.to_string(),
            schedule,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next fire time strictly after `after`, evaluated in `tz`
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Reject numeric values and steps outside each field's range
///
/// The schedule library is lenient about oversized step values, so the
/// range check happens up front.
fn validate_field_ranges(expr: &str, fields: &[&str]) -> Result<(), CronError> {
    const RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

    for (field, (min, max)) in fields.iter().zip(RANGES) {
        for part in field.split(',') {
            let (range_part, step) = match part.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (part, None),
            };

            if let Some(step) = step {
                match step.parse::<u32>() {
                    Ok(step) if step >= 1 && step <= max.max(1) => {}
                    _ => {
                        return Err(CronError::Invalid {
                            expr: expr.to_string(),
                            reason: format!("step {:?} out of range", step),
                        })
                    }
                }
            }

            if range_part == "*" || range_part == "?" {
                continue;
            }

            let bounds: Vec<&str> = range_part.split('-').collect();
            for bound in bounds {
                // Month and weekday names are validated by the parser.
                if bound.chars().all(|c| c.is_ascii_digit()) {
                    match bound.parse::<u32>() {
                        Ok(v) if v >= min && v <= max => {}
                        _ => {
                            return Err(CronError::Invalid {
                                expr: expr.to_string(),
                                reason: format!("value {:?} out of range", bound),
                            })
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Rewrite numeric day-of-week tokens (0=Sunday, 7=Sunday) as day names
fn normalise_dow(field: &str) -> String {
    const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

    let token = |t: &str| -> String {
        match t.parse::<usize>() {
            Ok(n) if n <= 7 => NAMES[n % 7].to_string(),
            _ => t.to_string(),
        }
    };

    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (part, None),
            };
            let mapped = match range.split_once('-') {
                Some((a, b)) => format!("{}-{}", token(a), token(b)),
                None => token(range),
            };
            match step {
                Some(step) => format!("{}/{}", mapped, step),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolve an IANA zone name, falling back to UTC on an unknown name
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Unknown timezone {:?}, falling back to UTC", name);
            Tz::UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_parse() {
        assert!(CronSchedule::parse("*/5 * * * *").is_ok());
        assert!(CronSchedule::parse("0 22 * * 1-5").is_ok());
        assert!(CronSchedule::parse("30 3 1 * *").is_ok());
        assert!(CronSchedule::parse("0 6 * * 0").is_ok());
        assert!(CronSchedule::parse("0 6 * * 7").is_ok());
        assert!(CronSchedule::parse("0 6 * * Mon,Wed,Fri").is_ok());
    }

    #[test]
    fn numeric_weekdays_map_to_names() {
        assert_eq!(normalise_dow("0"), "Sun");
        assert_eq!(normalise_dow("7"), "Sun");
        assert_eq!(normalise_dow("1-5"), "Mon-Fri");
        assert_eq!(normalise_dow("0,3"), "Sun,Wed");
        assert_eq!(normalise_dow("1-5/2"), "Mon-Fri/2");
        assert_eq!(normalise_dow("*"), "*");
        assert_eq!(normalise_dow("Sat"), "Sat");
    }

    #[test]
    fn sunday_zero_fires_on_sunday() {
        let schedule = CronSchedule::parse("0 6 * * 0").unwrap();
        // 2024-03-13 is a Wednesday; the next Sunday is the 17th.
        let after = Utc.with_ymd_and_hms(2024, 3, 13, 0, 0, 0).unwrap();
        let next = schedule.next_after(after, Tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 17, 6, 0, 0).unwrap());
    }

    #[test]
    fn descriptors_parse() {
        for d in ["@hourly", "@daily", "@weekly", "@monthly", "@yearly"] {
            assert!(CronSchedule::parse(d).is_ok(), "{} should parse", d);
        }
        assert!(CronSchedule::parse("@fortnightly").is_err());
    }

    #[test]
    fn out_of_range_step_is_rejected() {
        assert!(CronSchedule::parse("*/70 * * * *").is_err());
        assert!(CronSchedule::parse("* */30 * * *").is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(CronSchedule::parse("75 * * * *").is_err());
        assert!(CronSchedule::parse("* 25 * * *").is_err());
        assert!(CronSchedule::parse("* * 40 * *").is_err());
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("0 * * * * *").is_err());
        assert!(CronSchedule::parse("").is_err());
    }

    #[test]
    fn next_after_is_strictly_future() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now, Tz::UTC).unwrap();
        assert!(next > now);
        assert_eq!(next.timestamp() % 300, 0);
    }

    #[test]
    fn timezone_shifts_evaluation() {
        // 09:00 daily in Berlin is 08:00 or 07:00 UTC depending on DST.
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let next = schedule
            .next_after(after, "Europe/Berlin".parse().unwrap())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone("Mars/Olympus"), Tz::UTC);
        assert_eq!(resolve_timezone("Europe/Berlin").name(), "Europe/Berlin");
    }
}
