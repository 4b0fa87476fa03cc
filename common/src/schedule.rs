use chrono::{DateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timesource::Timestamp;

/// Daily trigger instant, hour + minute. Seconds are ignored for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeFieldError {
    #[error("time value is zero or missing")]
    Missing,
    #[error("epoch value {0} is out of range")]
    EpochOutOfRange(i64),
    #[error("invalid clock time `{0}` (expected `hh:mm AM/PM`)")]
    InvalidClock(String),
}

impl TimeOfDay {
    /// Derives the time-of-day from epoch seconds. Zero is the "unset"
    /// sentinel inherited from the configuration format.
    pub fn from_epoch(epoch: i64) -> Result<Self, TimeFieldError> {
        if epoch == 0 {
            return Err(TimeFieldError::Missing);
        }

        let parsed = DateTime::from_timestamp(epoch, 0)
            .ok_or(TimeFieldError::EpochOutOfRange(epoch))?
            .naive_utc();

        Ok(Self {
            hour: parsed.hour() as u8,
            minute: parsed.minute() as u8,
        })
    }

    /// Parses the later configuration revision's `"hh:mm AM/PM"` format.
    pub fn parse_clock(value: &str) -> Result<Self, TimeFieldError> {
        let invalid = || TimeFieldError::InvalidClock(value.to_string());

        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(TimeFieldError::Missing);
        }

        let (clock, meridiem) = trimmed.split_once(' ').ok_or_else(invalid)?;
        let (hour_str, minute_str) = clock.split_once(':').ok_or_else(invalid)?;

        let hour_12: u8 = hour_str.parse().map_err(|_| invalid())?;
        let minute: u8 = minute_str.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&hour_12) || minute > 59 {
            return Err(invalid());
        }

        let hour = match meridiem.trim().to_ascii_uppercase().as_str() {
            "AM" => hour_12 % 12,
            "PM" => hour_12 % 12 + 12,
            _ => return Err(invalid()),
        };

        Ok(Self { hour, minute })
    }

    pub fn matches(self, now: Timestamp) -> bool {
        now.hour() == self.hour as u32 && now.minute() == self.minute as u32
    }
}

/// Persisted representation of a schedule endpoint: the first configuration
/// revision stored epoch seconds, the later one `"hh:mm AM/PM"` strings.
/// Both remain accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeField {
    Epoch(i64),
    Clock(String),
}

impl TimeField {
    pub fn time_of_day(&self) -> Result<TimeOfDay, TimeFieldError> {
        match self {
            Self::Epoch(epoch) => TimeOfDay::from_epoch(*epoch),
            Self::Clock(value) => TimeOfDay::parse_clock(value),
        }
    }
}

/// The daily on/off pair driving the relay. Only actionable when `valid`,
/// which requires both endpoints to have been present and parseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub on: TimeOfDay,
    pub off: TimeOfDay,
    pub valid: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            on: TimeOfDay { hour: 0, minute: 0 },
            off: TimeOfDay { hour: 0, minute: 0 },
            valid: false,
        }
    }
}

impl Schedule {
    pub fn from_fields(on: Option<&TimeField>, off: Option<&TimeField>) -> Self {
        let parsed_on = on.and_then(|field| field.time_of_day().ok());
        let parsed_off = off.and_then(|field| field.time_of_day().ok());

        match (parsed_on, parsed_off) {
            (Some(on), Some(off)) => Self {
                on,
                off,
                valid: true,
            },
            _ => Self::default(),
        }
    }

    /// Level-triggered evaluation on minute-of-day equality.
    ///
    /// The off comparison runs after the on comparison, so when the two
    /// endpoints name the same minute the relay ends up off. Any minute
    /// matching neither endpoint leaves the previous state untouched, which
    /// makes sub-minute re-evaluation idempotent.
    pub fn evaluate(&self, now: Timestamp, previous: bool) -> bool {
        if !self.valid {
            return previous;
        }

        let mut state = previous;
        if self.on.matches(now) {
            state = true;
        }
        if self.off.matches(now) {
            state = false;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn at(hour: u32, minute: u32, second: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn epoch_schedule(on: i64, off: i64) -> Schedule {
        Schedule::from_fields(Some(&TimeField::Epoch(on)), Some(&TimeField::Epoch(off)))
    }

    #[test]
    fn epoch_fields_become_hour_minute() {
        // 28800 = 08:00, 64800 = 18:00.
        let schedule = epoch_schedule(28_800, 64_800);

        assert!(schedule.valid);
        assert_eq!(schedule.on, TimeOfDay { hour: 8, minute: 0 });
        assert_eq!(
            schedule.off,
            TimeOfDay {
                hour: 18,
                minute: 0
            }
        );
    }

    #[test]
    fn clock_strings_parse_both_meridiems() {
        assert_eq!(
            TimeOfDay::parse_clock("08:00 AM").unwrap(),
            TimeOfDay { hour: 8, minute: 0 }
        );
        assert_eq!(
            TimeOfDay::parse_clock("08:15 PM").unwrap(),
            TimeOfDay {
                hour: 20,
                minute: 15
            }
        );
        assert_eq!(
            TimeOfDay::parse_clock("12:00 AM").unwrap(),
            TimeOfDay { hour: 0, minute: 0 }
        );
        assert_eq!(
            TimeOfDay::parse_clock("12:30 pm").unwrap(),
            TimeOfDay {
                hour: 12,
                minute: 30
            }
        );
    }

    #[test]
    fn malformed_clock_strings_are_rejected() {
        for bad in ["", "8 AM", "25:00 AM", "08:61 PM", "08:00", "08:00 XX"] {
            assert!(TimeOfDay::parse_clock(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn zero_or_missing_endpoint_invalidates_schedule() {
        assert!(!epoch_schedule(0, 64_800).valid);
        assert!(!epoch_schedule(28_800, 0).valid);
        assert!(!Schedule::from_fields(Some(&TimeField::Epoch(28_800)), None).valid);
        assert!(!Schedule::default().valid);
    }

    #[test]
    fn on_minute_turns_relay_on_regardless_of_prior_state() {
        let schedule = epoch_schedule(28_800, 64_800);

        assert!(schedule.evaluate(at(8, 0, 0), false));
        assert!(schedule.evaluate(at(8, 0, 0), true));
        // Anywhere within the matching minute, not just second zero.
        assert!(schedule.evaluate(at(8, 0, 59), false));
    }

    #[test]
    fn off_minute_turns_relay_off_regardless_of_prior_state() {
        let schedule = epoch_schedule(28_800, 64_800);

        assert!(!schedule.evaluate(at(18, 0, 0), true));
        assert!(!schedule.evaluate(at(18, 0, 30), false));
    }

    #[test]
    fn non_matching_minutes_preserve_previous_state() {
        let schedule = epoch_schedule(28_800, 64_800);

        for (hour, minute) in [(7, 59), (8, 1), (12, 0), (17, 59), (18, 1), (23, 30)] {
            assert!(schedule.evaluate(at(hour, minute, 0), true));
            assert!(!schedule.evaluate(at(hour, minute, 0), false));
        }
    }

    #[test]
    fn equal_on_off_resolves_to_off() {
        let schedule = Schedule::from_fields(
            Some(&TimeField::Clock("08:00 AM".into())),
            Some(&TimeField::Clock("08:00 AM".into())),
        );

        assert!(schedule.valid);
        assert!(!schedule.evaluate(at(8, 0, 0), false));
        assert!(!schedule.evaluate(at(8, 0, 0), true));
    }

    #[test]
    fn invalid_schedule_always_returns_previous() {
        let schedule = Schedule::default();

        assert!(schedule.evaluate(at(0, 0, 0), true));
        assert!(!schedule.evaluate(at(0, 0, 0), false));
        assert!(schedule.evaluate(at(23, 59, 59), true));
    }

    #[test]
    fn repeated_evaluation_within_minute_is_idempotent() {
        let schedule = epoch_schedule(28_800, 64_800);

        let mut state = false;
        for second in 0..60 {
            state = schedule.evaluate(at(8, 0, second), state);
            assert!(state);
        }
    }
}
