// =============================================================================
// SCHEDULE EXPANDER
// =============================================================================
// Turns the weekly rules of a service into the concrete slots of one date.
//
// For every rule active on the date, slots of `effective_duration` minutes
// are laid back to back from `start_time`. A slot is kept only if it ends
// at or before `end_time`, so a rule yields
// floor((end_time - start_time) / effective_duration) slots.
//
// Overlapping rules are NOT merged: two rules covering 09:00 both produce a
// 09:00 slot, each with its own capacity (two counters open in parallel).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::rules::{ScheduleRule, Service};
use super::time;
use super::ValidationError;

// -----------------------------------------------------------------------------
// SLOT
// -----------------------------------------------------------------------------
/// A bookable interval on a specific date.
///
/// Slots are derived on every query and never stored.
///
/// # Example JSON
/// ```json
/// {
///   "start": "2025-06-11T08:00:00+08:00",
///   "end": "2025-06-11T08:30:00+08:00",
///   "capacity": 3,
///   "available": 1
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,

    /// Effective `capacity_per_slot` when the slot was generated
    pub capacity: i32,

    /// Seats left after subtracting non-cancelled bookings
    pub available: i32,
}

impl Slot {
    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start.with_timezone(&Utc)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        self.end.with_timezone(&Utc)
    }

    pub fn is_full(&self) -> bool {
        self.available <= 0
    }
}

// -----------------------------------------------------------------------------
// EXPANDER
// -----------------------------------------------------------------------------
/// Expands rules into slots. Rules without a time zone use `default_tz`.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleExpander {
    default_tz: Tz,
}

impl ScheduleExpander {
    pub fn new(default_tz: Tz) -> Self {
        Self { default_tz }
    }

    /// Produce the slots of `service` on `date`, sorted by start.
    ///
    /// Rules belonging to other services are ignored. Every slot starts with
    /// `available == capacity`; see [`apply_availability`].
    ///
    /// # Errors
    /// `NonPositiveDuration` when a rule's effective slot length is zero or
    /// negative, `UnknownTimezone` when a rule names an unknown zone.
    pub fn expand(
        &self,
        rules: &[ScheduleRule],
        service: &Service,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, ValidationError> {
        let mut slots = Vec::new();

        let applicable = rules
            .iter()
            .filter(|rule| rule.service_id == service.id && rule.is_active_on(date));

        for rule in applicable {
            let minutes = rule.effective_slot_minutes(service);
            if minutes <= 0 {
                return Err(ValidationError::NonPositiveDuration(minutes));
            }
            let step = Duration::minutes(i64::from(minutes));
            let capacity = rule.effective_capacity(service);
            let tz = rule.tz(self.default_tz)?;

            let window_end = date.and_time(rule.end_time);
            let mut cursor = date.and_time(rule.start_time);

            while cursor + step <= window_end {
                let next = cursor + step;
                match (localize(cursor, tz), localize(next, tz)) {
                    (Some(start), Some(end)) => slots.push(Slot {
                        start,
                        end,
                        capacity,
                        available: capacity,
                    }),
                    _ => tracing::debug!(
                        service_id = service.id,
                        local_start = %cursor,
                        timezone = %tz,
                        "Skipping slot that falls in a DST gap"
                    ),
                }
                cursor = next;
            }
        }

        // Stable: duplicates from overlapping rules keep rule order
        slots.sort_by_key(|slot| slot.start);

        Ok(slots)
    }

    /// Generated slots starting exactly at `start`.
    ///
    /// Both the calendar day of `start` in its own offset and in the default
    /// zone are expanded, so a client in another offset still finds the slot.
    /// Several slots come back when overlapping rules share the start.
    pub fn slots_starting_at(
        &self,
        rules: &[ScheduleRule],
        service: &Service,
        start: &DateTime<FixedOffset>,
    ) -> Result<Vec<Slot>, ValidationError> {
        let wanted = start.with_timezone(&Utc);

        let mut days = vec![
            start.date_naive(),
            start.with_timezone(&self.default_tz).date_naive(),
        ];
        days.dedup();

        let mut matching = Vec::new();
        for day in days {
            let slots = self.expand(rules, service, day)?;
            matching.extend(slots.into_iter().filter(|slot| slot.start_utc() == wanted));
        }
        Ok(matching)
    }
}

fn localize(local: NaiveDateTime, tz: Tz) -> Option<DateTime<FixedOffset>> {
    time::localize(local.date(), local.time(), tz).map(|t| t.fixed_offset())
}

// -----------------------------------------------------------------------------
// AVAILABILITY
// -----------------------------------------------------------------------------
/// Set `available = max(0, capacity - booked)` where `booked` counts
/// non-cancelled appointments starting exactly at the slot start.
pub fn apply_availability(slots: &mut [Slot], booked: &HashMap<DateTime<Utc>, i64>) {
    for slot in slots.iter_mut() {
        let taken = booked.get(&slot.start_utc()).copied().unwrap_or(0);
        slot.available = remaining(slot.capacity, taken);
    }
}

fn remaining(capacity: i32, taken: i64) -> i32 {
    let taken = i32::try_from(taken).unwrap_or(i32::MAX);
    capacity.saturating_sub(taken).max(0)
}

// -----------------------------------------------------------------------------
// SEAT SELECTION
// -----------------------------------------------------------------------------
/// Every slot sharing the requested start is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no seat left (largest capacity {capacity})")]
pub struct SeatsTaken {
    pub capacity: i32,
}

/// Pick the slot a booking goes into.
///
/// `slots` all start at the same instant (duplicates from overlapping rules)
/// and `taken` is the number of non-cancelled bookings at that instant. The
/// count is subtracted from every duplicate; the first one with a seat left
/// wins.
pub fn pick_seat(slots: &mut [Slot], taken: i64) -> Result<&Slot, SeatsTaken> {
    for slot in slots.iter_mut() {
        slot.available = remaining(slot.capacity, taken);
    }

    match slots.iter().position(|slot| !slot.is_full()) {
        Some(index) => Ok(&slots[index]),
        None => Err(SeatsTaken {
            capacity: slots.iter().map(|slot| slot.capacity).max().unwrap_or(0),
        }),
    }
}
