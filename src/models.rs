// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the database layer and the HTTP API.
//
// Schedule rules, services and slots live in `scheduling`; this module holds
// appointments plus request/response bodies.
// =============================================================================

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::scheduling::{Decision, ScheduleRule};

// =============================================================================
// APPOINTMENT
// =============================================================================

// -----------------------------------------------------------------------------
// STATUS
// -----------------------------------------------------------------------------
/// Lifecycle of an appointment.
///
/// `booked` → `cancelled` is user driven. `checked_in`, `serving`, `done`
/// and `no_show` are set by staff at the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "appointment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Booked,
    Cancelled,
    CheckedIn,
    Serving,
    Done,
    NoShow,
}

impl AppointmentStatus {
    /// Everything except `cancelled` holds the user's day and a seat in the slot.
    pub fn is_active(self) -> bool {
        self != AppointmentStatus::Cancelled
    }

    /// Check-in is allowed from `booked`, and repeated from `checked_in`.
    pub fn can_check_in(self) -> bool {
        matches!(self, AppointmentStatus::Booked | AppointmentStatus::CheckedIn)
    }
}

// -----------------------------------------------------------------------------
// APPOINTMENT RECORD
// -----------------------------------------------------------------------------
/// A user's booking of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Appointment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_id: i64,
    pub department_id: i64,

    /// Local calendar day of `slot_start`
    pub slot_date: NaiveDate,

    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub status: AppointmentStatus,

    /// Department queue number for the day, assigned at check-in
    pub queue_number: Option<i32>,

    /// Shown as a QR code and scanned at the counter
    pub qr_token: String,

    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// SCHEDULE RECORD
// =============================================================================
/// A stored schedule rule. Serializes flat: `{ "id": 7, "service_id": 1, ... }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ScheduleRecord {
    pub id: i64,

    #[sqlx(flatten)]
    #[serde(flatten)]
    pub rule: ScheduleRule,
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_ticket_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueTicketStatus {
    Waiting,
    Serving,
    Done,
    NoShow,
}

/// A numbered place in a department's queue, issued when an appointment
/// checks in. Numbers restart at 1 every day per department.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct QueueTicket {
    pub id: i64,
    pub department_id: i64,
    pub service_id: i64,
    pub appointment_id: Uuid,
    pub queue_date: NaiveDate,
    pub number: i32,
    pub status: QueueTicketStatus,
    pub called_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// BOOKING REQUEST
// -----------------------------------------------------------------------------
/// Request body for booking (and prechecking) a slot
///
/// # Example JSON
/// ```json
/// {
///   "service_id": 1,
///   "slot_start": "2025-06-11T08:30:00+08:00"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub service_id: i64,
    pub slot_start: DateTime<FixedOffset>,

    #[serde(default)]
    pub notes: Option<String>,
}

// -----------------------------------------------------------------------------
// PRECHECK RESPONSE
// -----------------------------------------------------------------------------
/// Result of running the booking guard without booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckResponse {
    /// `allow`, `reject_same_day` or `reject_overlap`
    pub decision: String,

    pub allowed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting: Option<Appointment>,
}

impl From<Decision<'_>> for PrecheckResponse {
    fn from(decision: Decision<'_>) -> Self {
        Self {
            decision: decision.code().to_string(),
            allowed: decision.is_allowed(),
            conflicting: decision.conflicting().cloned(),
        }
    }
}

// -----------------------------------------------------------------------------
// CHECK-IN
// -----------------------------------------------------------------------------
/// Body of a check-in: the token read from the appointment's QR code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRequest {
    pub qr_token: String,
}

/// What a department's queue display shows.
///
/// # Example JSON
/// ```json
/// { "department_id": 1, "date": "2025-06-11", "now_serving": 12, "waiting": 4 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueNowResponse {
    pub department_id: i64,
    pub date: NaiveDate,

    /// Number of the most recently called ticket still being served
    pub now_serving: Option<i32>,

    pub waiting: i64,
}

// -----------------------------------------------------------------------------
// CANCEL RESPONSE
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub id: Uuid,
    pub status: AppointmentStatus,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Structured context, e.g. the offending field or the conflicting appointment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn appointment() -> Appointment {
        let start = Utc.with_ymd_and_hms(2025, 6, 10, 1, 0, 0).unwrap();
        Appointment {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            service_id: 2,
            department_id: 1,
            slot_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            slot_start: start,
            slot_end: start + chrono::Duration::minutes(30),
            status: AppointmentStatus::CheckedIn,
            queue_number: Some(4),
            qr_token: "abc".to_string(),
            notes: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn status_uses_snake_case_on_the_wire() {
        let json = serde_json::to_value(appointment()).unwrap();
        assert_eq!(json["status"], "checked_in");
        assert_eq!(json["slot_date"], "2025-06-10");

        let parsed: AppointmentStatus = serde_json::from_str("\"no_show\"").unwrap();
        assert_eq!(parsed, AppointmentStatus::NoShow);
    }

    #[test]
    fn only_cancelled_is_inactive() {
        assert!(!AppointmentStatus::Cancelled.is_active());
        assert!(AppointmentStatus::Booked.is_active());
        assert!(AppointmentStatus::NoShow.is_active());
    }

    #[test]
    fn check_in_only_from_booked_or_checked_in() {
        assert!(AppointmentStatus::Booked.can_check_in());
        assert!(AppointmentStatus::CheckedIn.can_check_in());
        for status in [
            AppointmentStatus::Cancelled,
            AppointmentStatus::Serving,
            AppointmentStatus::Done,
            AppointmentStatus::NoShow,
        ] {
            assert!(!status.can_check_in(), "{status:?}");
        }
    }

    #[test]
    fn queue_now_serializes_empty_queue() {
        let response = QueueNowResponse {
            department_id: 1,
            date: NaiveDate::from_ymd_opt(2025, 6, 11).unwrap(),
            now_serving: None,
            waiting: 0,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["date"], "2025-06-11");
        assert!(json["now_serving"].is_null());
        assert_eq!(json["waiting"], 0);

        let status: QueueTicketStatus = serde_json::from_str("\"no_show\"").unwrap();
        assert_eq!(status, QueueTicketStatus::NoShow);
    }

    #[test]
    fn schedule_record_serializes_flat() {
        let record = ScheduleRecord {
            id: 7,
            rule: ScheduleRule {
                service_id: 1,
                day_of_week: 0,
                start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                slot_minutes: None,
                capacity_per_slot: Some(3),
                valid_from: None,
                valid_to: None,
                timezone: Some("Asia/Manila".to_string()),
            },
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["start_time"], "08:00");
        assert_eq!(json["capacity_per_slot"], 3);
    }

    #[test]
    fn precheck_response_from_decision() {
        let existing = appointment();
        let response = PrecheckResponse::from(Decision::RejectSameDay(&existing));
        assert_eq!(response.decision, "reject_same_day");
        assert!(!response.allowed);
        assert_eq!(response.conflicting.map(|a| a.queue_number), Some(Some(4)));

        let allow = PrecheckResponse::from(Decision::Allow);
        assert!(allow.allowed);
        let json = serde_json::to_value(&allow).unwrap();
        assert!(json.get("conflicting").is_none());
    }

    #[test]
    fn booking_request_accepts_offsets() {
        let req: BookAppointmentRequest = serde_json::from_str(
            r#"{"service_id": 1, "slot_start": "2025-06-11T08:30:00+08:00"}"#,
        )
        .unwrap();
        assert_eq!(
            req.slot_start.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2025, 6, 11, 0, 30, 0).unwrap()
        );
        assert!(req.notes.is_none());
    }
}
