//! Calendar rule deciding when the next backup of a database is due.
//! All arithmetic is in UTC; the daily/weekly/monthly kinds use the
//! "previous scheduled slot" rule so a missed slot is caught up on the
//! next scheduler tick while completed slots stay quiet.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};

use crate::errors::StewardError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalKind {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntervalKind::Hourly => "HOURLY",
            IntervalKind::Daily => "DAILY",
            IntervalKind::Weekly => "WEEKLY",
            IntervalKind::Monthly => "MONTHLY",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for IntervalKind {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "HOURLY" => Ok(IntervalKind::Hourly),
            "DAILY" => Ok(IntervalKind::Daily),
            "WEEKLY" => Ok(IntervalKind::Weekly),
            "MONTHLY" => Ok(IntervalKind::Monthly),
            other => Err(StewardError::validation(format!(
                "unknown interval kind: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Interval {
    pub kind: IntervalKind,
    /// "HH:MM", required for daily, weekly and monthly intervals
    pub time_of_day: Option<String>,
    /// 0 = Sunday .. 6 = Saturday, only for WEEKLY
    pub weekday: Option<u8>,
    /// 1..=31, only for MONTHLY
    pub day_of_month: Option<u8>,
}

impl Interval {
    pub fn daily_at(time_of_day: &str) -> Interval {
        Interval {
            kind: IntervalKind::Daily,
            time_of_day: Some(time_of_day.to_string()),
            weekday: None,
            day_of_month: None,
        }
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        if matches!(
            self.kind,
            IntervalKind::Daily | IntervalKind::Weekly | IntervalKind::Monthly
        ) {
            let time = self.time_of_day.as_deref().ok_or_else(|| {
                StewardError::validation(
                    "time of day is required for daily, weekly and monthly intervals",
                )
            })?;
            parse_time_of_day(time).ok_or_else(|| {
                StewardError::validation(format!("time of day is not HH:MM: {time}"))
            })?;
        }

        if self.kind == IntervalKind::Weekly {
            let weekday = self
                .weekday
                .ok_or_else(|| StewardError::validation("weekday is required for weekly intervals"))?;
            if weekday > 6 {
                return Err(StewardError::validation("weekday must be within 0..=6"));
            }
        }

        if self.kind == IntervalKind::Monthly {
            let day = self.day_of_month.ok_or_else(|| {
                StewardError::validation("day of month is required for monthly intervals")
            })?;
            if !(1..=31).contains(&day) {
                return Err(StewardError::validation("day of month must be within 1..=31"));
            }
        }

        Ok(())
    }

    /// Whether a backup should start now given the previous backup time.
    pub fn should_trigger_backup(
        &self,
        now: DateTime<Utc>,
        last_backup: Option<DateTime<Utc>>,
    ) -> bool {
        // Nothing taken yet: trigger immediately
        let last = match last_backup {
            Some(last) => last,
            None => return true,
        };

        match self.kind {
            IntervalKind::Hourly => now.signed_duration_since(last) >= Duration::hours(1),
            IntervalKind::Daily => self.should_trigger_daily(now, last),
            IntervalKind::Weekly => self.should_trigger_weekly(now, last),
            IntervalKind::Monthly => self.should_trigger_monthly(now, last),
        }
    }

    fn should_trigger_daily(&self, now: DateTime<Utc>, last: DateTime<Utc>) -> bool {
        let time = match self.time_of_day.as_deref() {
            Some(t) => t,
            None => return last.date_naive() < now.date_naive(),
        };
        let time = match parse_time_of_day(time) {
            Some(t) => t,
            None => return false, // malformed, play safe
        };

        let today_slot = at_time(now.date_naive(), time);
        // The last slot that should already have happened
        let last_scheduled = if now < today_slot {
            today_slot - Duration::days(1)
        } else {
            today_slot
        };

        // Fire when past the slot and nothing was taken since it; a manual
        // backup earlier the same day does not count
        now >= last_scheduled && last < last_scheduled
    }

    fn should_trigger_weekly(&self, now: DateTime<Utc>, last: DateTime<Utc>) -> bool {
        let weekday = match self.weekday {
            Some(w) => w,
            // No weekday: generic 7-day interval
            None => return now.signed_duration_since(last) >= Duration::days(7),
        };

        // 0=Sunday maps to the end of the ISO week
        let days_from_monday = if weekday == 0 { 6 } else { i64::from(weekday) - 1 };
        let monday = now.date_naive() - Duration::days(i64::from(now.weekday().num_days_from_monday()));
        let target_day = monday + Duration::days(days_from_monday);

        let time = self
            .time_of_day
            .as_deref()
            .and_then(parse_time_of_day)
            .unwrap_or(NaiveTime::MIN);
        let target_this_week = at_time(target_day, time);

        now >= target_this_week && last < target_this_week
    }

    fn should_trigger_monthly(&self, now: DateTime<Utc>, last: DateTime<Utc>) -> bool {
        let day = match self.day_of_month {
            Some(d) => u32::from(d),
            // No day: fire once we are in a new calendar month
            None => return last < start_of_month(now),
        };

        let time = self
            .time_of_day
            .as_deref()
            .and_then(parse_time_of_day)
            .unwrap_or(NaiveTime::MIN);

        // Day 31 in a shorter month: no slot this month
        let target_day = match now.date_naive().with_day(day) {
            Some(d) => d,
            None => return false,
        };
        let target_this_month = at_time(target_day, time);

        now >= target_this_month && last < target_this_month
    }
}

fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

fn at_time(date: chrono::NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now
        .date_naive()
        .with_day(1)
        .expect("every month has a first day");
    at_time(first, NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn weekly(weekday: u8, time: &str) -> Interval {
        Interval {
            kind: IntervalKind::Weekly,
            time_of_day: Some(time.to_string()),
            weekday: Some(weekday),
            day_of_month: None,
        }
    }

    fn monthly(day: u8, time: &str) -> Interval {
        Interval {
            kind: IntervalKind::Monthly,
            time_of_day: Some(time.to_string()),
            weekday: None,
            day_of_month: Some(day),
        }
    }

    #[test]
    fn hourly_triggers_after_a_full_hour() {
        let interval = Interval {
            kind: IntervalKind::Hourly,
            time_of_day: None,
            weekday: None,
            day_of_month: None,
        };
        let now = utc(2024, 1, 15, 12, 0);

        assert!(interval.should_trigger_backup(now, None));
        assert!(!interval.should_trigger_backup(now, Some(now - Duration::minutes(59))));
        assert!(interval.should_trigger_backup(now, Some(now - Duration::hours(1))));
        assert!(interval.should_trigger_backup(now, Some(now - Duration::hours(2))));
    }

    #[test]
    fn daily_honours_the_scheduled_slot() {
        let interval = Interval::daily_at("09:00");
        let yesterday_nine = utc(2024, 1, 14, 9, 0);

        // Before today's slot, nothing due
        assert!(!interval.should_trigger_backup(utc(2024, 1, 15, 8, 59), Some(yesterday_nine)));
        // At and after the slot
        assert!(interval.should_trigger_backup(utc(2024, 1, 15, 9, 0), Some(yesterday_nine)));
        assert!(interval.should_trigger_backup(utc(2024, 1, 15, 9, 1), Some(yesterday_nine)));
        // Already taken today at the slot
        assert!(
            !interval.should_trigger_backup(utc(2024, 1, 15, 15, 0), Some(utc(2024, 1, 15, 9, 0)))
        );
        // Yesterday's backup was after the slot time, today still fires
        assert!(interval.should_trigger_backup(utc(2024, 1, 15, 9, 0), Some(utc(2024, 1, 14, 15, 0))));
    }

    #[test]
    fn daily_manual_backup_before_slot_does_not_suppress_it() {
        let interval = Interval::daily_at("21:00");
        let manual = utc(2025, 6, 6, 16, 17);
        let scheduled = utc(2025, 6, 6, 21, 0);

        assert!(interval.should_trigger_backup(scheduled, Some(manual)));
    }

    #[test]
    fn daily_catches_up_a_missed_slot() {
        let interval = Interval::daily_at("21:00");

        // June 7 15:00, yesterday's 21:00 slot was missed
        let now = utc(2025, 6, 7, 15, 0);
        let last = utc(2025, 6, 6, 16, 0);
        assert!(interval.should_trigger_backup(now, Some(last)));
    }

    #[test]
    fn weekly_triggers_at_the_weekday_slot() {
        // Wednesday 15:00 (0=Sunday, 3=Wednesday)
        let interval = weekly(3, "15:00");
        let previous_week = utc(2024, 1, 10, 15, 0);

        assert!(interval.should_trigger_backup(utc(2024, 1, 17, 16, 0), None));
        assert!(!interval.should_trigger_backup(utc(2024, 1, 17, 14, 59), Some(previous_week)));
        assert!(interval.should_trigger_backup(utc(2024, 1, 17, 15, 0), Some(previous_week)));
        assert!(interval.should_trigger_backup(utc(2024, 1, 17, 15, 1), Some(previous_week)));

        // Taken at the slot: quiet for the rest of the week
        assert!(
            !interval.should_trigger_backup(utc(2024, 1, 18, 10, 0), Some(utc(2024, 1, 17, 15, 0)))
        );
        // Manual backup same day before the slot does not suppress it
        assert!(
            interval.should_trigger_backup(utc(2024, 1, 17, 15, 0), Some(utc(2024, 1, 17, 10, 0)))
        );
        // Manual backup after the slot does
        assert!(
            !interval.should_trigger_backup(utc(2024, 1, 18, 10, 0), Some(utc(2024, 1, 17, 16, 0)))
        );
        // Missed slot caught up the next day
        assert!(interval.should_trigger_backup(utc(2024, 1, 18, 10, 0), Some(previous_week)));
    }

    #[test]
    fn weekly_friday_midnight_ignores_midweek_manual_backup() {
        let interval = weekly(5, "00:00");
        let friday = utc(2024, 1, 19, 0, 0);
        let wednesday_manual = utc(2024, 1, 17, 21, 0);

        assert!(interval.should_trigger_backup(friday, Some(wednesday_manual)));
    }

    #[test]
    fn weekly_sunday_lands_at_the_end_of_the_iso_week() {
        let interval = weekly(0, "06:00");
        // Sunday January 21, 2024; the week started Monday the 15th
        let sunday = utc(2024, 1, 21, 6, 0);
        let monday_backup = utc(2024, 1, 15, 6, 0);

        assert!(interval.should_trigger_backup(sunday, Some(monday_backup)));
        assert!(!interval.should_trigger_backup(utc(2024, 1, 21, 5, 59), Some(monday_backup)));
    }

    #[test]
    fn monthly_triggers_at_the_dated_slot() {
        let interval = monthly(10, "08:00");
        let previous_month = utc(2023, 12, 10, 8, 0);

        assert!(interval.should_trigger_backup(utc(2024, 1, 15, 10, 0), None));
        assert!(!interval.should_trigger_backup(utc(2024, 1, 10, 7, 59), Some(previous_month)));
        assert!(interval.should_trigger_backup(utc(2024, 1, 10, 8, 0), Some(previous_month)));
        // Slot already served this month
        assert!(
            !interval.should_trigger_backup(utc(2024, 1, 20, 9, 0), Some(utc(2024, 1, 10, 8, 0)))
        );
        // Missed slot caught up later in the month
        assert!(interval.should_trigger_backup(utc(2024, 1, 20, 9, 0), Some(previous_month)));
    }

    #[test]
    fn monthly_day_31_skips_short_months() {
        let interval = monthly(31, "03:00");
        // February has no 31st; nothing fires all month
        assert!(
            !interval.should_trigger_backup(utc(2024, 2, 29, 12, 0), Some(utc(2024, 1, 31, 3, 0)))
        );
        // March has one again
        assert!(
            interval.should_trigger_backup(utc(2024, 3, 31, 3, 0), Some(utc(2024, 1, 31, 3, 0)))
        );
    }

    #[test]
    fn validation_enforces_kind_specific_fields() {
        assert!(Interval::daily_at("04:00").validate().is_ok());

        let no_time = Interval {
            kind: IntervalKind::Daily,
            time_of_day: None,
            weekday: None,
            day_of_month: None,
        };
        assert!(no_time.validate().is_err());

        let bad_time = Interval::daily_at("24:61");
        assert!(bad_time.validate().is_err());

        let mut no_weekday = weekly(3, "15:00");
        no_weekday.weekday = None;
        assert!(no_weekday.validate().is_err());

        assert!(weekly(7, "15:00").validate().is_err());

        let mut no_day = monthly(10, "08:00");
        no_day.day_of_month = None;
        assert!(no_day.validate().is_err());

        assert!(monthly(32, "08:00").validate().is_err());

        let hourly = Interval {
            kind: IntervalKind::Hourly,
            time_of_day: None,
            weekday: None,
            day_of_month: None,
        };
        assert!(hourly.validate().is_ok());
    }
}
