use std::str::FromStr;

use chrono::TimeZone;
use chrono_tz::Tz;

use crate::error::{CronError, Result};
use crate::types::CronSchedule;

/// Compute the next fire time (unix ms) strictly after `now_ms`.
///
/// Returns `Ok(None)` when the schedule is exhausted (an `at` instant already
/// in the past).
pub fn next_run_at(schedule: &CronSchedule, now_ms: i64, tz: &Tz) -> Result<Option<i64>> {
    match schedule {
        CronSchedule::Every { every_ms } => Ok(Some(now_ms + *every_ms as i64)),

        CronSchedule::At { at_ms } => Ok(if *at_ms > now_ms { Some(*at_ms) } else { None }),

        CronSchedule::Cron { expr } => {
            let parsed = cron::Schedule::from_str(&normalize_expr(expr))
                .map_err(|e| CronError::InvalidSchedule(format!("{expr}: {e}")))?;
            let now = tz
                .timestamp_millis_opt(now_ms)
                .single()
                .ok_or_else(|| CronError::InvalidSchedule("ambiguous local time".into()))?;
            Ok(parsed.after(&now).next().map(|dt| dt.timestamp_millis()))
        }
    }
}

/// The `cron` crate wants a seconds field; the tool surface speaks 5-field
/// expressions. Prepend `0` unless seconds are already present.
fn normalize_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Validate an expression without computing anything.
pub fn validate_expr(expr: &str) -> Result<()> {
    cron::Schedule::from_str(&normalize_expr(expr))
        .map(|_| ())
        .map_err(|e| CronError::InvalidSchedule(format!("{expr}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shanghai() -> Tz {
        "Asia/Shanghai".parse().unwrap()
    }

    #[test]
    fn every_advances_by_exact_interval() {
        let tz = shanghai();
        let schedule = CronSchedule::Every { every_ms: 5_000 };
        let first = next_run_at(&schedule, 1_000_000, &tz).unwrap().unwrap();
        let second = next_run_at(&schedule, first, &tz).unwrap().unwrap();
        assert_eq!(first, 1_005_000);
        assert_eq!(second - first, 5_000);
    }

    #[test]
    fn at_fires_once_then_exhausts() {
        let tz = shanghai();
        let schedule = CronSchedule::At { at_ms: 2_000 };
        assert_eq!(next_run_at(&schedule, 1_000, &tz).unwrap(), Some(2_000));
        assert_eq!(next_run_at(&schedule, 2_000, &tz).unwrap(), None);
    }

    #[test]
    fn cron_next_is_in_the_future_and_matches_minute() {
        let tz = shanghai();
        // 2025-01-01 00:00:00 UTC.
        let now_ms = 1_735_689_600_000i64;
        let schedule = CronSchedule::Cron { expr: "30 9 * * *".into() };
        let next = next_run_at(&schedule, now_ms, &tz).unwrap().unwrap();
        assert!(next > now_ms);

        let local = tz.timestamp_millis_opt(next).single().unwrap();
        use chrono::Timelike;
        assert_eq!(local.hour(), 9);
        assert_eq!(local.minute(), 30);
        assert_eq!(local.second(), 0);
    }

    #[test]
    fn successive_cron_fires_are_distinct_minutes() {
        let tz = shanghai();
        let schedule = CronSchedule::Cron { expr: "* * * * *".into() };
        let now_ms = 1_735_689_601_000i64;
        let first = next_run_at(&schedule, now_ms, &tz).unwrap().unwrap();
        let second = next_run_at(&schedule, first, &tz).unwrap().unwrap();
        assert_eq!(second - first, 60_000);
    }

    #[test]
    fn bad_expression_is_rejected() {
        assert!(validate_expr("not a cron").is_err());
        assert!(validate_expr("0 9 * * *").is_ok());
    }
}
