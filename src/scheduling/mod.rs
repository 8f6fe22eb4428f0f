// =============================================================================
// SCHEDULING MODULE
// =============================================================================
// Pure scheduling logic shared by every endpoint that deals with slots:
//
// - time:     date / time-of-day parsing, weekdays, time zones
// - rules:    weekly schedule rules and their validation
// - expander: rules + date → concrete bookable slots
// - guard:    may this user book this slot, given their appointments?
//
// Nothing in here touches the network or the database. Callers fetch a
// snapshot, run these functions once, and act on the result.
// =============================================================================

pub mod expander;
pub mod guard;
pub mod rules;
pub mod time;

use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

pub use expander::{pick_seat, ScheduleExpander, SeatsTaken, Slot};
pub use guard::{intervals_overlap, BookingGuard, Decision};
pub use rules::{NewService, ScheduleBlock, ScheduleBlockSet, ScheduleRule, Service};

// =============================================================================
// VALIDATION ERRORS
// =============================================================================
// Malformed input is rejected with the offending field named. Values are
// never clamped into range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("day_of_week must be between 0 (Monday) and 6 (Sunday), got {0}")]
    DayOfWeekOutOfRange(i16),

    #[error("start_time {start} must be before end_time {end}")]
    InvalidTimeRange { start: NaiveTime, end: NaiveTime },

    #[error("slot_minutes must be between 5 and 240, got {0}")]
    SlotMinutesOutOfRange(i32),

    #[error("capacity_per_slot must be between 1 and 50, got {0}")]
    CapacityOutOfRange(i32),

    #[error("valid_from {from} must not be after valid_to {to}")]
    InvalidValidityWindow { from: NaiveDate, to: NaiveDate },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTime(String),

    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("service name must not be empty")]
    EmptyName,

    #[error("duration_min must be between 5 and 240, got {0}")]
    DurationOutOfRange(i32),

    /// Slot length resolved to zero or less; expansion refuses to run.
    #[error("slot duration must be positive, got {0} minutes")]
    NonPositiveDuration(i32),
}

impl ValidationError {
    /// Name of the input field the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            Self::DayOfWeekOutOfRange(_) => "day_of_week",
            Self::InvalidTimeRange { .. } | Self::InvalidTime(_) => "start_time",
            Self::SlotMinutesOutOfRange(_) | Self::NonPositiveDuration(_) => "slot_minutes",
            Self::CapacityOutOfRange(_) => "capacity_per_slot",
            Self::InvalidValidityWindow { .. } => "valid_from",
            Self::UnknownTimezone(_) => "timezone",
            Self::InvalidDate(_) => "date",
            Self::EmptyName => "name",
            Self::DurationOutOfRange(_) => "duration_min",
        }
    }
}

// Bounds shared by rule overrides and service defaults
pub const MIN_SLOT_MINUTES: i32 = 5;
pub const MAX_SLOT_MINUTES: i32 = 240;
pub const MIN_CAPACITY: i32 = 1;
pub const MAX_CAPACITY: i32 = 50;
