// =============================================================================
// ERROR MODULE
// =============================================================================
// Service error type and its HTTP mapping.
//
// - 400: malformed input (validation errors name the field)
// - 401: missing caller identity
// - 404: unknown service / appointment
// - 409: booking conflicts (slot full, same-day, overlap, duplicates)
// - 500: database / cache / internal, never echoing internal details
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, FixedOffset};
use serde_json::json;
use thiserror::Error;

use crate::models::{Appointment, ErrorResponse};
use crate::scheduling::{Decision, ValidationError};

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // -------------------------------------------------------------------------
    // REQUEST ERRORS
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Rule, service or date failed validation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // -------------------------------------------------------------------------
    // BOOKING CONFLICTS
    // -------------------------------------------------------------------------
    /// Every seat of the slot is taken
    #[error("Slot starting {slot_start} is full (capacity {capacity})")]
    SlotFull {
        slot_start: DateTime<FixedOffset>,
        capacity: i32,
    },

    /// User already holds a non-cancelled appointment that day
    #[error("Already booked on {}", .0.slot_date)]
    AlreadyBookedSameDay(Box<Appointment>),

    /// Candidate slot intersects an existing appointment
    #[error("Overlaps appointment at {}", .0.slot_start)]
    OverlappingAppointment(Box<Appointment>),

    #[error("Conflict: {0}")]
    Conflict(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Turn a guard rejection into the matching conflict error.
    /// `Decision::Allow` yields `None`.
    pub fn from_decision(decision: Decision<'_>) -> Option<Self> {
        match decision {
            Decision::Allow => None,
            Decision::RejectSameDay(a) => Some(AppError::AlreadyBookedSameDay(Box::new(a.clone()))),
            Decision::RejectOverlap(a) => Some(AppError::OverlappingAppointment(Box::new(a.clone()))),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None),

            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone(), None),

            AppError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                err.to_string(),
                Some(json!({ "field": err.field() })),
            ),

            AppError::SlotFull { slot_start, capacity } => (
                StatusCode::CONFLICT,
                "SLOT_FULL",
                "This time slot is already full. Please pick another time.".to_string(),
                Some(json!({ "slot_start": slot_start, "capacity": capacity })),
            ),

            AppError::AlreadyBookedSameDay(existing) => (
                StatusCode::CONFLICT,
                "ALREADY_BOOKED_SAME_DAY",
                "You already have a booking that day. Cancel it first to book again.".to_string(),
                Some(json!({ "conflicting": existing })),
            ),

            AppError::OverlappingAppointment(existing) => (
                StatusCode::CONFLICT,
                "OVERLAPPING_APPOINTMENT",
                "You already have an appointment at that time.".to_string(),
                Some(json!({ "conflicting": existing })),
            ),

            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None),

            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),

            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = self.parts();

        if status.is_server_error() {
            tracing::error!(error_code = error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = error_code, message = %message, "Request rejected");
        }

        let body = match details {
            Some(details) => ErrorResponse::with_details(error_code, message, details),
            None => ErrorResponse::new(error_code, message),
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentStatus;
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn existing() -> Appointment {
        let start = Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap();
        Appointment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            service_id: 1,
            department_id: 1,
            slot_date: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            slot_start: start,
            slot_end: start + chrono::Duration::minutes(30),
            status: AppointmentStatus::Booked,
            queue_number: None,
            qr_token: "qr".to_string(),
            notes: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn status_codes() {
        let slot_start = Utc::now().fixed_offset();
        let cases = [
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (AppError::Validation(ValidationError::CapacityOutOfRange(0)), StatusCode::BAD_REQUEST),
            (AppError::SlotFull { slot_start, capacity: 2 }, StatusCode::CONFLICT),
            (AppError::AlreadyBookedSameDay(Box::new(existing())), StatusCode::CONFLICT),
            (AppError::OverlappingAppointment(Box::new(existing())), StatusCode::CONFLICT),
            (AppError::Conflict("dup".into()), StatusCode::CONFLICT),
            (AppError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn validation_details_name_the_field() {
        let (_, code, _, details) = AppError::from(ValidationError::SlotMinutesOutOfRange(300)).parts();
        assert_eq!(code, "VALIDATION_ERROR");
        assert_eq!(details.unwrap()["field"], "slot_minutes");
    }

    #[test]
    fn internal_errors_hide_details() {
        let (_, _, message, details) = AppError::Internal("password=hunter2".into()).parts();
        assert!(!message.contains("hunter2"));
        assert!(details.is_none());
    }

    #[test]
    fn guard_rejections_map_to_conflicts() {
        let appt = existing();
        assert!(AppError::from_decision(Decision::Allow).is_none());

        let same_day = AppError::from_decision(Decision::RejectSameDay(&appt)).unwrap();
        let (status, code, _, details) = same_day.parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "ALREADY_BOOKED_SAME_DAY");
        assert_eq!(details.unwrap()["conflicting"]["id"], appt.id.to_string());

        let overlap = AppError::from_decision(Decision::RejectOverlap(&appt)).unwrap();
        let (_, code, message, details) = overlap.parts();
        assert_eq!(code, "OVERLAPPING_APPOINTMENT");
        // UTC clock times would mislead users in other zones; the instant is in details
        assert!(!message.contains("09:00"));
        assert_eq!(
            details.unwrap()["conflicting"]["slot_start"],
            serde_json::to_value(appt.slot_start).unwrap()
        );
    }
}
