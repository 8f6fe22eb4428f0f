use appointment_service::models::{Appointment, AppointmentStatus};
use appointment_service::scheduling::{
    intervals_overlap, BookingGuard, ScheduleExpander, ScheduleRule, Service, Slot,
};
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use proptest::prelude::*;
use uuid::Uuid;

// 2025-06-11 is a Wednesday
const WEDNESDAY: i16 = 2;

fn wednesday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 11).unwrap()
}

fn service() -> Service {
    Service {
        id: 1,
        department_id: 1,
        name: "Cedula Issuance".to_string(),
        description: None,
        duration_min: 15,
        capacity_per_slot: 2,
        is_active: true,
    }
}

fn minute_of_day(minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0).unwrap()
}

fn rule(start_minute: u32, end_minute: u32, slot_minutes: i32) -> ScheduleRule {
    ScheduleRule {
        service_id: 1,
        day_of_week: WEDNESDAY,
        start_time: minute_of_day(start_minute),
        end_time: minute_of_day(end_minute),
        slot_minutes: Some(slot_minutes),
        capacity_per_slot: None,
        valid_from: None,
        valid_to: None,
        timezone: None,
    }
}

/// (start minute, end minute, slot minutes) with start < end inside one day
fn window_strategy() -> impl Strategy<Value = (u32, u32, i32)> {
    (0u32..1435, 5i32..=240).prop_flat_map(|(start, minutes)| {
        ((start + 1)..1440).prop_map(move |end| (start, end, minutes))
    })
}

fn cancelled_at(start_minute: u32, length: i64) -> Appointment {
    let start = Utc.from_utc_datetime(&wednesday().and_time(minute_of_day(start_minute)));
    Appointment {
        id: Uuid::new_v4(),
        user_id: Uuid::nil(),
        service_id: 1,
        department_id: 1,
        slot_date: wednesday(),
        slot_start: start,
        slot_end: start + Duration::minutes(length),
        status: AppointmentStatus::Cancelled,
        queue_number: None,
        qr_token: "token".to_string(),
        notes: None,
        created_at: start,
        updated_at: start,
    }
}

proptest! {
    #[test]
    fn slot_count_is_window_divided_by_duration((start, end, minutes) in window_strategy()) {
        let expander = ScheduleExpander::new(Tz::UTC);
        let slots = expander.expand(&[rule(start, end, minutes)], &service(), wednesday()).unwrap();

        let expected = (end - start) / minutes as u32;
        prop_assert_eq!(slots.len(), expected as usize);
    }

    #[test]
    fn slots_stay_inside_the_window((start, end, minutes) in window_strategy()) {
        let expander = ScheduleExpander::new(Tz::UTC);
        let slots = expander.expand(&[rule(start, end, minutes)], &service(), wednesday()).unwrap();

        let window_start = Utc.from_utc_datetime(&wednesday().and_time(minute_of_day(start)));
        let window_end = Utc.from_utc_datetime(&wednesday().and_time(minute_of_day(end)));
        for (i, slot) in slots.iter().enumerate() {
            prop_assert!(slot.start_utc() >= window_start);
            prop_assert!(slot.end_utc() <= window_end);
            prop_assert_eq!(slot.end_utc() - slot.start_utc(), Duration::minutes(i64::from(minutes)));
            prop_assert_eq!(
                slot.start_utc(),
                window_start + Duration::minutes(i64::from(minutes) * i as i64)
            );
        }
    }

    #[test]
    fn overlapping_rules_are_sorted_and_keep_duplicates(
        (start_a, end_a, minutes_a) in window_strategy(),
        (start_b, end_b, minutes_b) in window_strategy(),
    ) {
        let expander = ScheduleExpander::new(Tz::UTC);
        let rules = [rule(start_a, end_a, minutes_a), rule(start_b, end_b, minutes_b)];
        let combined = expander.expand(&rules, &service(), wednesday()).unwrap();

        let alone_a = expander.expand(&rules[..1], &service(), wednesday()).unwrap();
        let alone_b = expander.expand(&rules[1..], &service(), wednesday()).unwrap();
        prop_assert_eq!(combined.len(), alone_a.len() + alone_b.len());
        prop_assert!(combined.windows(2).all(|pair| pair[0].start <= pair[1].start));
    }

    #[test]
    fn expansion_is_idempotent((start, end, minutes) in window_strategy()) {
        let expander = ScheduleExpander::new(Tz::Asia__Manila);
        let rules = [rule(start, end, minutes)];

        let first: Vec<Slot> = expander.expand(&rules, &service(), wednesday()).unwrap();
        let second: Vec<Slot> = expander.expand(&rules, &service(), wednesday()).unwrap();
        prop_assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn overlap_is_symmetric(a in 0i64..1000, a_len in 1i64..120, b in 0i64..1000, b_len in 1i64..120) {
        prop_assert_eq!(
            intervals_overlap(a, a + a_len, b, b + b_len),
            intervals_overlap(b, b + b_len, a, a + a_len)
        );
    }

    #[test]
    fn back_to_back_intervals_never_overlap(start in 0i64..1000, first in 1i64..120, second in 1i64..120) {
        let boundary = start + first;
        prop_assert!(!intervals_overlap(start, boundary, boundary, boundary + second));
    }

    #[test]
    fn cancelled_appointments_never_block(
        starts in proptest::collection::vec(0u32..1380, 0..8),
        (start, end, minutes) in window_strategy(),
    ) {
        let existing: Vec<Appointment> = starts.iter().map(|s| cancelled_at(*s, 60)).collect();
        let guard = BookingGuard::new(Tz::UTC);
        let expander = ScheduleExpander::new(Tz::UTC);

        for slot in expander.expand(&[rule(start, end, minutes)], &service(), wednesday()).unwrap() {
            prop_assert!(guard.can_book(&existing, &slot, wednesday()).is_allowed());
        }
    }
}
