// =============================================================================
// SCHEDULE RULES
// =============================================================================
// A schedule rule is a recurring weekly availability block for one service:
// "Mondays 08:00-12:00, 30 minute slots, 3 people per slot, during June".
//
// Admins author rules; the expander turns them into slots for one date at a
// time. Rules are never materialized into a calendar.
// =============================================================================

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::{self, hhmm};
use super::{ValidationError, MAX_CAPACITY, MAX_SLOT_MINUTES, MIN_CAPACITY, MIN_SLOT_MINUTES};

// =============================================================================
// SERVICE
// =============================================================================
/// A bookable service offered by a department (e.g. "Business Permit Renewal").
///
/// Its `duration_min` and `capacity_per_slot` apply to every rule that does
/// not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: i64,
    pub department_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub duration_min: i32,
    pub capacity_per_slot: i32,
    pub is_active: bool,
}

/// Request body for creating a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    pub department_id: i64,
    #[serde(default)]
    pub description: Option<String>,
    pub duration_min: i32,
    pub capacity_per_slot: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl NewService {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&self.duration_min) {
            return Err(ValidationError::DurationOutOfRange(self.duration_min));
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.capacity_per_slot) {
            return Err(ValidationError::CapacityOutOfRange(self.capacity_per_slot));
        }
        Ok(())
    }
}

// =============================================================================
// SCHEDULE RULE
// =============================================================================
/// Recurring weekly availability block.
///
/// # Example JSON
/// ```json
/// {
///   "service_id": 1,
///   "day_of_week": 0,
///   "start_time": "08:00",
///   "end_time": "12:00",
///   "slot_minutes": 30,
///   "capacity_per_slot": null,
///   "valid_from": "2025-06-01",
///   "valid_to": "2025-06-30",
///   "timezone": "Asia/Manila"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ScheduleRule {
    pub service_id: i64,

    /// Monday=0 … Sunday=6
    pub day_of_week: i16,

    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,

    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,

    /// Overrides the service's `duration_min`
    #[serde(default)]
    pub slot_minutes: Option<i32>,

    /// Overrides the service's `capacity_per_slot`
    #[serde(default)]
    pub capacity_per_slot: Option<i32>,

    /// Inclusive; `None` means open-ended
    #[serde(default)]
    pub valid_from: Option<NaiveDate>,

    /// Inclusive; `None` means open-ended
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,

    /// IANA zone name; `None` means the service default
    #[serde(default)]
    pub timezone: Option<String>,
}

impl ScheduleRule {
    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0..=6).contains(&self.day_of_week) {
            return Err(ValidationError::DayOfWeekOutOfRange(self.day_of_week));
        }
        if self.start_time >= self.end_time {
            return Err(ValidationError::InvalidTimeRange {
                start: self.start_time,
                end: self.end_time,
            });
        }
        if let Some(minutes) = self.slot_minutes {
            if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&minutes) {
                return Err(ValidationError::SlotMinutesOutOfRange(minutes));
            }
        }
        if let Some(capacity) = self.capacity_per_slot {
            if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
                return Err(ValidationError::CapacityOutOfRange(capacity));
            }
        }
        if let (Some(from), Some(to)) = (self.valid_from, self.valid_to) {
            if from > to {
                return Err(ValidationError::InvalidValidityWindow { from, to });
            }
        }
        if let Some(name) = self.timezone.as_deref() {
            time::resolve_timezone(Some(name), Tz::UTC)?;
        }
        Ok(())
    }

    /// Does this rule produce slots on `date`?
    ///
    /// True when the weekday matches and `date` lies inside the validity
    /// window. A missing bound leaves that side open.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        if self.day_of_week != time::weekday_index(date) {
            return false;
        }
        let after_start = self.valid_from.map_or(true, |from| from <= date);
        let before_end = self.valid_to.map_or(true, |to| date <= to);
        after_start && before_end
    }

    pub fn effective_slot_minutes(&self, service: &Service) -> i32 {
        self.slot_minutes.unwrap_or(service.duration_min)
    }

    pub fn effective_capacity(&self, service: &Service) -> i32 {
        self.capacity_per_slot.unwrap_or(service.capacity_per_slot)
    }

    pub fn tz(&self, default: Tz) -> Result<Tz, ValidationError> {
        time::resolve_timezone(self.timezone.as_deref(), default)
    }
}

// =============================================================================
// SCHEDULE BLOCKS (admin authoring form)
// =============================================================================
// The admin screen collects "blocks" (a time range plus optional overrides)
// and a shared date range. With "weekdays only" every block becomes five
// rules, Monday to Friday; otherwise each block keeps its own day.

/// One time range as entered on the admin form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleBlock {
    /// Only used when `weekdays_only` is off
    #[serde(default)]
    pub day_of_week: i16,

    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,

    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,

    #[serde(default)]
    pub slot_minutes: Option<i32>,

    #[serde(default)]
    pub capacity_per_slot: Option<i32>,

    #[serde(default)]
    pub timezone: Option<String>,
}

/// A full admin submission: blocks for one service over one date range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleBlockSet {
    pub service_id: i64,

    #[serde(default)]
    pub valid_from: Option<NaiveDate>,

    #[serde(default)]
    pub valid_to: Option<NaiveDate>,

    #[serde(default = "default_true")]
    pub weekdays_only: bool,

    pub blocks: Vec<ScheduleBlock>,
}

/// Monday through Friday
const WEEKDAYS: [i16; 5] = [0, 1, 2, 3, 4];

impl ScheduleBlockSet {
    /// Expand the blocks into independent rules sharing the date range.
    pub fn into_rules(self) -> Vec<ScheduleRule> {
        let Self {
            service_id,
            valid_from,
            valid_to,
            weekdays_only,
            blocks,
        } = self;

        blocks
            .into_iter()
            .flat_map(|block| {
                let days: Vec<i16> = if weekdays_only {
                    WEEKDAYS.to_vec()
                } else {
                    vec![block.day_of_week]
                };

                days.into_iter().map(move |day_of_week| ScheduleRule {
                    service_id,
                    day_of_week,
                    start_time: block.start_time,
                    end_time: block.end_time,
                    slot_minutes: block.slot_minutes,
                    capacity_per_slot: block.capacity_per_slot,
                    valid_from,
                    valid_to,
                    timezone: block.timezone.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn service() -> Service {
        Service {
            id: 1,
            department_id: 10,
            name: "Business Permit".to_string(),
            description: None,
            duration_min: 15,
            capacity_per_slot: 2,
            is_active: true,
        }
    }

    fn rule() -> ScheduleRule {
        ScheduleRule {
            service_id: 1,
            day_of_week: 2,
            start_time: hm(8, 0),
            end_time: hm(12, 0),
            slot_minutes: None,
            capacity_per_slot: None,
            valid_from: None,
            valid_to: None,
            timezone: None,
        }
    }

    #[test]
    fn valid_rule_passes() {
        assert_eq!(rule().validate(), Ok(()));
    }

    #[test]
    fn validation_names_the_bad_field() {
        let cases = [
            (ScheduleRule { day_of_week: 7, ..rule() }, "day_of_week"),
            (ScheduleRule { end_time: hm(8, 0), ..rule() }, "start_time"),
            (ScheduleRule { slot_minutes: Some(4), ..rule() }, "slot_minutes"),
            (ScheduleRule { slot_minutes: Some(241), ..rule() }, "slot_minutes"),
            (ScheduleRule { capacity_per_slot: Some(0), ..rule() }, "capacity_per_slot"),
            (ScheduleRule { capacity_per_slot: Some(51), ..rule() }, "capacity_per_slot"),
            (
                ScheduleRule {
                    valid_from: Some(ymd(2025, 7, 1)),
                    valid_to: Some(ymd(2025, 6, 1)),
                    ..rule()
                },
                "valid_from",
            ),
            (ScheduleRule { timezone: Some("Nowhere/Land".into()), ..rule() }, "timezone"),
        ];

        for (rule, field) in cases {
            let err = rule.validate().expect_err("rule should be rejected");
            assert_eq!(err.field(), field, "{err}");
        }
    }

    #[test]
    fn boundary_overrides_are_accepted() {
        let low = ScheduleRule { slot_minutes: Some(5), capacity_per_slot: Some(1), ..rule() };
        let high = ScheduleRule { slot_minutes: Some(240), capacity_per_slot: Some(50), ..rule() };
        assert_eq!(low.validate(), Ok(()));
        assert_eq!(high.validate(), Ok(()));
    }

    #[test]
    fn active_on_matching_weekday_inside_window() {
        let rule = ScheduleRule {
            valid_from: Some(ymd(2025, 6, 1)),
            valid_to: Some(ymd(2025, 6, 30)),
            ..rule()
        };
        // 2025-06-11 is a Wednesday
        assert!(rule.is_active_on(ymd(2025, 6, 11)));
        assert!(!rule.is_active_on(ymd(2025, 6, 10)));
        // Wednesday outside the window
        assert!(!rule.is_active_on(ymd(2025, 7, 2)));
    }

    #[test]
    fn open_ended_window() {
        let rule = ScheduleRule { valid_from: Some(ymd(2025, 6, 1)), ..rule() };
        assert!(rule.is_active_on(ymd(2030, 1, 2)));
        assert!(!rule.is_active_on(ymd(2025, 5, 28)));
    }

    #[test]
    fn overrides_fall_back_to_service_defaults() {
        let svc = service();
        assert_eq!(rule().effective_slot_minutes(&svc), 15);
        assert_eq!(rule().effective_capacity(&svc), 2);

        let custom = ScheduleRule { slot_minutes: Some(30), capacity_per_slot: Some(5), ..rule() };
        assert_eq!(custom.effective_slot_minutes(&svc), 30);
        assert_eq!(custom.effective_capacity(&svc), 5);
    }

    #[test]
    fn rule_json_uses_hh_mm() {
        let json = serde_json::to_value(rule()).unwrap();
        assert_eq!(json["start_time"], "08:00");
        assert_eq!(json["end_time"], "12:00");

        let parsed: ScheduleRule = serde_json::from_value(serde_json::json!({
            "service_id": 1,
            "day_of_week": 2,
            "start_time": "08:00",
            "end_time": "12:00"
        }))
        .unwrap();
        assert_eq!(parsed, rule());
    }

    #[test]
    fn weekdays_only_expands_to_five_rules() {
        let set = ScheduleBlockSet {
            service_id: 1,
            valid_from: Some(ymd(2025, 6, 1)),
            valid_to: Some(ymd(2025, 6, 30)),
            weekdays_only: true,
            blocks: vec![ScheduleBlock {
                day_of_week: 6,
                start_time: hm(8, 0),
                end_time: hm(12, 0),
                slot_minutes: Some(30),
                capacity_per_slot: None,
                timezone: Some("Asia/Manila".into()),
            }],
        };

        let rules = set.into_rules();
        let days: Vec<i16> = rules.iter().map(|r| r.day_of_week).collect();
        assert_eq!(days, vec![0, 1, 2, 3, 4]);
        assert!(rules.iter().all(|r| r.slot_minutes == Some(30)
            && r.valid_to == Some(ymd(2025, 6, 30))
            && r.timezone.as_deref() == Some("Asia/Manila")));
    }

    #[test]
    fn single_day_blocks_keep_their_day() {
        let block = |day| ScheduleBlock {
            day_of_week: day,
            start_time: hm(13, 0),
            end_time: hm(17, 0),
            slot_minutes: None,
            capacity_per_slot: None,
            timezone: None,
        };
        let set = ScheduleBlockSet {
            service_id: 3,
            valid_from: None,
            valid_to: None,
            weekdays_only: false,
            blocks: vec![block(5), block(6)],
        };

        let rules = set.into_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].day_of_week, 5);
        assert_eq!(rules[1].day_of_week, 6);
        assert!(rules.iter().all(|r| r.service_id == 3));
    }

    #[test]
    fn new_service_validation() {
        let ok = NewService {
            name: "Cedula".into(),
            department_id: 1,
            description: None,
            duration_min: 15,
            capacity_per_slot: 1,
            is_active: true,
        };
        assert_eq!(ok.validate(), Ok(()));
        assert_eq!(
            NewService { name: "  ".into(), ..ok.clone() }.validate(),
            Err(ValidationError::EmptyName)
        );
        assert_eq!(
            NewService { duration_min: 0, ..ok.clone() }.validate(),
            Err(ValidationError::DurationOutOfRange(0))
        );
        assert_eq!(
            NewService { capacity_per_slot: 60, ..ok }.validate(),
            Err(ValidationError::CapacityOutOfRange(60))
        );
    }
}
