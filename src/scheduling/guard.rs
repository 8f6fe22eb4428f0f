// =============================================================================
// BOOKING GUARD
// =============================================================================
// Decides whether a user may book a candidate slot, given their existing
// appointments. Two rules, checked in this order:
//
// 1. Same day: at most one non-cancelled appointment per calendar day,
//    across all services, whatever the time of the candidate slot.
// 2. Overlap: no non-cancelled appointment may intersect the candidate's
//    [start, end) interval.
//
// The guard is pure. The booking endpoint runs it inside the booking
// transaction; the precheck endpoint runs it on its own for quick feedback.
// =============================================================================

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use super::expander::Slot;
use crate::models::Appointment;

// -----------------------------------------------------------------------------
// DECISION
// -----------------------------------------------------------------------------
/// Outcome of a booking check. Rejections borrow the appointment that
/// caused them so the caller can tell the user which one it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'a> {
    Allow,
    RejectSameDay(&'a Appointment),
    RejectOverlap(&'a Appointment),
}

impl<'a> Decision<'a> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn conflicting(&self) -> Option<&'a Appointment> {
        match *self {
            Decision::Allow => None,
            Decision::RejectSameDay(a) | Decision::RejectOverlap(a) => Some(a),
        }
    }

    /// Stable machine-readable name, used in API bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::RejectSameDay(_) => "reject_same_day",
            Decision::RejectOverlap(_) => "reject_overlap",
        }
    }
}

// -----------------------------------------------------------------------------
// GUARD
// -----------------------------------------------------------------------------
/// Calendar days are evaluated in `tz`.
#[derive(Debug, Clone, Copy)]
pub struct BookingGuard {
    tz: Tz,
}

impl BookingGuard {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Local calendar date of an instant.
    pub fn calendar_date<T: TimeZone>(&self, instant: &DateTime<T>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Appointments (any status) whose start falls on `on_date`.
    pub fn same_day<'a>(
        &self,
        existing: &'a [Appointment],
        on_date: NaiveDate,
    ) -> impl Iterator<Item = &'a Appointment> + 'a {
        let tz = self.tz;
        existing
            .iter()
            .filter(move |a| a.slot_start.with_timezone(&tz).date_naive() == on_date)
    }

    /// Check a candidate slot against the user's appointments.
    pub fn can_book<'a>(
        &self,
        existing: &'a [Appointment],
        candidate: &Slot,
        on_date: NaiveDate,
    ) -> Decision<'a> {
        if let Some(active) = self
            .same_day(existing, on_date)
            .find(|a| a.status.is_active())
        {
            return Decision::RejectSameDay(active);
        }

        let same_day = self.same_day(existing, on_date);
        match find_overlap(same_day, candidate.start_utc(), candidate.end_utc()) {
            Some(conflict) => Decision::RejectOverlap(conflict),
            None => Decision::Allow,
        }
    }
}

/// First non-cancelled appointment intersecting `[start, end)`.
pub fn find_overlap<'a, I>(appointments: I, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<&'a Appointment>
where
    I: IntoIterator<Item = &'a Appointment>,
{
    appointments
        .into_iter()
        .filter(|a| a.status.is_active())
        .find(|a| intervals_overlap(a.slot_start, a.slot_end, start, end))
}

/// Half-open interval intersection. Back-to-back intervals do not overlap.
pub fn intervals_overlap<T: Ord>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && a_end > b_start
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentStatus;
    use uuid::Uuid;

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, h, m, 0).unwrap()
    }

    fn appointment(start: DateTime<Utc>, end: DateTime<Utc>, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            service_id: 1,
            department_id: 1,
            slot_date: start.date_naive(),
            slot_start: start,
            slot_end: end,
            status,
            queue_number: None,
            qr_token: "qr".to_string(),
            notes: None,
            created_at: start,
            updated_at: start,
        }
    }

    fn slot(start: DateTime<Utc>, end: DateTime<Utc>) -> Slot {
        Slot {
            start: start.fixed_offset(),
            end: end.fixed_offset(),
            capacity: 1,
            available: 1,
        }
    }

    fn june_10() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 10).unwrap()
    }

    fn guard() -> BookingGuard {
        BookingGuard::new(Tz::UTC)
    }

    #[test]
    fn same_day_booking_blocks_any_other_slot_that_day() {
        let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Booked)];
        let candidate = slot(at(10, 14, 0), at(10, 14, 30));

        let decision = guard().can_book(&existing, &candidate, june_10());
        assert_eq!(decision, Decision::RejectSameDay(&existing[0]));
        assert_eq!(decision.code(), "reject_same_day");
    }

    #[test]
    fn cancelled_booking_frees_the_day() {
        let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Cancelled)];
        let candidate = slot(at(10, 14, 0), at(10, 14, 30));

        assert_eq!(guard().can_book(&existing, &candidate, june_10()), Decision::Allow);
    }

    #[test]
    fn cancelled_booking_in_the_same_slot_does_not_block() {
        let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Cancelled)];
        let candidate = slot(at(10, 9, 0), at(10, 9, 30));

        assert!(guard().can_book(&existing, &candidate, june_10()).is_allowed());
    }

    #[test]
    fn staff_driven_statuses_still_count_as_active() {
        for status in [
            AppointmentStatus::CheckedIn,
            AppointmentStatus::Serving,
            AppointmentStatus::Done,
            AppointmentStatus::NoShow,
        ] {
            let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), status)];
            let candidate = slot(at(10, 15, 0), at(10, 15, 30));
            assert!(matches!(
                guard().can_book(&existing, &candidate, june_10()),
                Decision::RejectSameDay(_)
            ));
        }
    }

    #[test]
    fn bookings_on_other_days_are_ignored() {
        let existing = vec![
            appointment(at(9, 9, 0), at(9, 9, 30), AppointmentStatus::Booked),
            appointment(at(11, 9, 0), at(11, 9, 30), AppointmentStatus::Booked),
        ];
        let candidate = slot(at(10, 9, 0), at(10, 9, 30));

        assert_eq!(guard().can_book(&existing, &candidate, june_10()), Decision::Allow);
    }

    #[test]
    fn overlap_detection_on_its_own() {
        let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Booked)];

        let overlapping = find_overlap(&existing, at(10, 9, 15), at(10, 9, 45));
        assert_eq!(overlapping, Some(&existing[0]));

        let back_to_back = find_overlap(&existing, at(10, 9, 30), at(10, 10, 0));
        assert_eq!(back_to_back, None);

        let containing = find_overlap(&existing, at(10, 8, 0), at(10, 12, 0));
        assert_eq!(containing, Some(&existing[0]));
    }

    #[test]
    fn overlap_ignores_cancelled_appointments() {
        let existing = vec![
            appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Cancelled),
            appointment(at(10, 9, 15), at(10, 9, 45), AppointmentStatus::Booked),
        ];
        assert_eq!(
            find_overlap(&existing, at(10, 9, 0), at(10, 9, 30)),
            Some(&existing[1])
        );
    }

    #[test]
    fn interval_overlap_is_half_open() {
        assert!(intervals_overlap(1, 3, 2, 4));
        assert!(intervals_overlap(2, 4, 1, 3));
        assert!(intervals_overlap(1, 5, 2, 3));
        assert!(!intervals_overlap(1, 2, 2, 3));
        assert!(!intervals_overlap(2, 3, 1, 2));
        assert!(!intervals_overlap(1, 2, 5, 6));
    }

    #[test]
    fn calendar_day_follows_guard_timezone() {
        // 23:30 UTC on June 9 is 07:30 on June 10 in Manila
        let existing = vec![appointment(at(9, 23, 30), at(10, 0, 0), AppointmentStatus::Booked)];
        let candidate = slot(at(10, 6, 0), at(10, 6, 30));

        let manila = BookingGuard::new(Tz::Asia__Manila);
        assert!(matches!(
            manila.can_book(&existing, &candidate, june_10()),
            Decision::RejectSameDay(_)
        ));
        assert!(guard().can_book(&existing, &candidate, june_10()).is_allowed());
    }

    #[test]
    fn decision_exposes_conflicting_appointment() {
        let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Booked)];
        let decision = Decision::RejectOverlap(&existing[0]);
        assert_eq!(decision.conflicting().map(|a| a.id), Some(existing[0].id));
        assert_eq!(decision.code(), "reject_overlap");
        assert_eq!(Decision::Allow.conflicting(), None);
    }

    #[test]
    fn guard_is_idempotent() {
        let existing = vec![appointment(at(10, 9, 0), at(10, 9, 30), AppointmentStatus::Booked)];
        let candidate = slot(at(10, 9, 0), at(10, 9, 30));
        let first = guard().can_book(&existing, &candidate, june_10());
        let second = guard().can_book(&existing, &candidate, june_10());
        assert_eq!(first, second);
    }
}
