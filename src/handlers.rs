// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer).
//
// Handlers stay thin: parse the request, call the scheduling core or the
// database, record metrics. The booking rules themselves live in
// `scheduling` and are enforced again inside the booking transaction.
// =============================================================================

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::scheduling::expander::apply_availability;
use crate::scheduling::{time, NewService, ScheduleBlockSet, ScheduleRule, Service, Slot};
use crate::AppState;

// =============================================================================
// CALLER IDENTITY
// =============================================================================
/// Header set by the gateway after authenticating the citizen
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller, read from `X-User-Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub Uuid);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;

        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(CallerId)
            .ok_or_else(|| AppError::Unauthorized("X-User-Id must be a UUID".to_string()))
    }
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "appointment-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: PostgreSQL and Redis must both answer.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;
    let redis_healthy = state.cache.ping().await;

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus scrape endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// SHARED LOOKUPS
// =============================================================================

async fn active_service(state: &AppState, service_id: i64) -> AppResult<Service> {
    let start = Instant::now();
    let service = state.db.get_service(service_id).await?;
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    service
        .filter(|s| s.is_active)
        .ok_or_else(|| AppError::NotFound(format!("Service not found: {service_id}")))
}

/// Rules of a service: Redis first, then PostgreSQL (and refill the cache).
async fn load_schedules(state: &AppState, service_id: i64) -> AppResult<Vec<ScheduleRecord>> {
    if let Some(records) = state.cache.get(service_id).await {
        tracing::debug!(service_id = service_id, "Schedule cache hit");
        return Ok(records);
    }

    let start = Instant::now();
    let records = state.db.schedules_for_service(service_id).await?;
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    state.cache.put(service_id, &records).await;
    Ok(records)
}

fn into_rules(records: Vec<ScheduleRecord>) -> Vec<ScheduleRule> {
    records.into_iter().map(|record| record.rule).collect()
}

// =============================================================================
// SERVICES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ServiceParams {
    pub department_id: Option<i64>,
}

/// Active services, ordered by name
///
/// GET /api/v1/services?department_id=3
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ServiceParams>,
) -> AppResult<Json<Vec<Service>>> {
    let start = Instant::now();

    let services = state.db.list_services(params.department_id).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/services", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(services))
}

/// Weekly rules of one service
///
/// GET /api/v1/services/:id/schedules
pub async fn service_schedules(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<i64>,
) -> AppResult<Json<Vec<ScheduleRecord>>> {
    let start = Instant::now();

    active_service(&state, service_id).await?;
    let records = load_schedules(&state, service_id).await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/services/:id/schedules",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(records))
}

// =============================================================================
// SLOTS
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SlotParams {
    /// Calendar day, `YYYY-MM-DD`
    pub day: String,

    /// Drop slots with no seats left (default: false)
    #[serde(default)]
    pub only_available: bool,
}

/// Slots of a service on one day with live availability
///
/// GET /api/v1/services/:id/slots?day=2025-06-11&only_available=true
///
/// # Response
/// ```json
/// [
///   { "start": "2025-06-11T08:00:00+08:00", "end": "2025-06-11T08:30:00+08:00",
///     "capacity": 3, "available": 2 }
/// ]
/// ```
pub async fn service_slots(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<i64>,
    Query(params): Query<SlotParams>,
) -> AppResult<Json<Vec<Slot>>> {
    let start = Instant::now();

    let day = time::parse_date(&params.day)?;
    let service = active_service(&state, service_id).await?;
    let rules = into_rules(load_schedules(&state, service_id).await?);

    let mut slots = state.expander.expand(&rules, &service, day)?;

    let window = slots
        .iter()
        .map(Slot::start_utc)
        .min()
        .zip(slots.iter().map(Slot::end_utc).max());
    if let Some((from, to)) = window {
        let db_start = Instant::now();
        let booked = state.db.booked_counts(service_id, from, to).await?;
        metrics::record_db_query("select", db_start.elapsed().as_secs_f64());

        apply_availability(&mut slots, &booked);
    }

    metrics::record_slots_generated(service_id, slots.len());

    if params.only_available {
        slots.retain(|slot| !slot.is_full());
    }

    tracing::debug!(
        service_id = service_id,
        day = %day,
        slots = slots.len(),
        "Generated slots"
    );

    metrics::record_http_request(
        "GET",
        "/api/v1/services/:id/slots",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(slots))
}

// =============================================================================
// APPOINTMENTS
// =============================================================================

/// Metric label for a booking failure
fn booking_outcome(err: &AppError) -> &'static str {
    match err {
        AppError::SlotFull { .. } => "slot_full",
        AppError::AlreadyBookedSameDay(_) => "reject_same_day",
        AppError::OverlappingAppointment(_) => "reject_overlap",
        AppError::BadRequest(_) | AppError::Validation(_) => "invalid_slot",
        AppError::NotFound(_) => "unknown_service",
        AppError::Conflict(_) => "conflict",
        _ => "error",
    }
}

/// Book a slot
///
/// POST /api/v1/appointments
///
/// # Request Body
/// ```json
/// { "service_id": 1, "slot_start": "2025-06-11T08:30:00+08:00", "notes": "Bring ID" }
/// ```
///
/// # Response
/// - 201 Created: the new appointment
/// - 400 Bad Request: no slot starts at `slot_start`
/// - 409 Conflict: slot full, same-day booking, or overlap
pub async fn book_appointment(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(request): Json<BookAppointmentRequest>,
) -> AppResult<(StatusCode, Json<Appointment>)> {
    let start = Instant::now();

    tracing::info!(
        user_id = %user_id,
        service_id = request.service_id,
        slot_start = %request.slot_start,
        "Attempting to book appointment"
    );

    let result = state
        .db
        .book_appointment(user_id, &request, &state.expander, &state.guard)
        .await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_db_query("booking", duration);

    match result {
        Ok(appointment) => {
            metrics::record_http_request("POST", "/api/v1/appointments", 201, duration);
            metrics::record_booking("booked");

            tracing::info!(
                appointment_id = %appointment.id,
                slot_date = %appointment.slot_date,
                "Appointment booked"
            );

            Ok((StatusCode::CREATED, Json(appointment)))
        }
        Err(e) => {
            let outcome = booking_outcome(&e);
            metrics::record_booking(outcome);
            metrics::record_http_request(
                "POST",
                "/api/v1/appointments",
                e.status_code().as_u16(),
                duration,
            );

            tracing::warn!(
                user_id = %user_id,
                outcome = outcome,
                error = %e,
                "Booking rejected"
            );

            Err(e)
        }
    }
}

/// Run the booking guard for a slot without booking it
///
/// POST /api/v1/appointments/precheck
///
/// Advisory only: the booking transaction checks everything again.
pub async fn precheck_appointment(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(request): Json<BookAppointmentRequest>,
) -> AppResult<Json<PrecheckResponse>> {
    let start = Instant::now();

    let service = active_service(&state, request.service_id).await?;
    let rules = into_rules(load_schedules(&state, service.id).await?);

    let matching = state
        .expander
        .slots_starting_at(&rules, &service, &request.slot_start)?;
    let slot = matching.first().ok_or_else(|| {
        AppError::BadRequest(format!(
            "No bookable slot starts at {}",
            request.slot_start.to_rfc3339()
        ))
    })?;

    let existing = state.db.appointments_for_user(user_id).await?;
    let on_date = state.guard.calendar_date(&slot.start);
    let response = PrecheckResponse::from(state.guard.can_book(&existing, slot, on_date));

    metrics::record_http_request(
        "POST",
        "/api/v1/appointments/precheck",
        200,
        start.elapsed().as_secs_f64(),
    );

    Ok(Json(response))
}

/// The caller's appointments, newest first
///
/// GET /api/v1/appointments/me
pub async fn my_appointments(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> AppResult<Json<Vec<Appointment>>> {
    let start = Instant::now();

    let appointments = state.db.appointments_for_user(user_id).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/appointments/me", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(appointments))
}

/// The caller's next active appointment that has not ended, or `null`
///
/// GET /api/v1/appointments/me/current
pub async fn my_current_appointment(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> AppResult<Json<Option<Appointment>>> {
    let start = Instant::now();

    let current = state.db.current_appointment(user_id, Utc::now()).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/appointments/me/current", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(current))
}

/// Cancel one of the caller's booked appointments
///
/// POST /api/v1/appointments/:id/cancel
pub async fn cancel_appointment(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CancelResponse>> {
    let start = Instant::now();

    let cancelled = state.db.cancel_appointment(user_id, id).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/appointments/:id/cancel", 200, duration);
    metrics::record_db_query("update", duration);

    tracing::info!(appointment_id = %id, user_id = %user_id, "Appointment cancelled");

    Ok(Json(CancelResponse {
        ok: true,
        id: cancelled.id,
        status: cancelled.status,
    }))
}

// =============================================================================
// CHECK-IN & QUEUE
// =============================================================================

/// Check in at the office by presenting the appointment's QR token
///
/// POST /api/v1/appointments/:id/checkin
///
/// # Request Body
/// ```json
/// { "qr_token": "5f0c2e8b9a4d4c1e8e6b3a7d2c9f1b04" }
/// ```
///
/// # Response
/// - 200 OK: the queue ticket (the same ticket on repeated check-in)
/// - 401 Unauthorized: token does not match
/// - 400 Bad Request: appointment is not booked or checked in
/// - 404 Not Found: unknown appointment
pub async fn checkin_appointment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CheckinRequest>,
) -> AppResult<Json<QueueTicket>> {
    let start = Instant::now();

    let queue_date = state.guard.calendar_date(&Utc::now());
    let ticket = state.db.check_in(id, request.qr_token.trim(), queue_date).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/appointments/:id/checkin", 200, duration);
    metrics::record_db_query("update", duration);

    tracing::info!(
        appointment_id = %id,
        department_id = ticket.department_id,
        number = ticket.number,
        "Appointment checked in"
    );

    Ok(Json(ticket))
}

#[derive(Debug, Deserialize)]
pub struct QueueParams {
    pub department_id: i64,
}

/// Today's queue of a department
///
/// GET /api/v1/appointments/queue/now?department_id=1
pub async fn queue_now(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueueParams>,
) -> AppResult<Json<QueueNowResponse>> {
    let start = Instant::now();

    let today = state.guard.calendar_date(&Utc::now());
    let queue = state.db.queue_now(params.department_id, today).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/appointments/queue/now", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(queue))
}

// =============================================================================
// ADMIN ENDPOINTS
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ScheduleParams {
    pub department_id: Option<i64>,
    pub service_id: Option<i64>,
}

/// GET /api/v1/admin/schedules?department_id=3&service_id=1
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScheduleParams>,
) -> AppResult<Json<Vec<ScheduleRecord>>> {
    let start = Instant::now();

    let records = state
        .db
        .list_schedules(params.department_id, params.service_id)
        .await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/admin/schedules", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(records))
}

/// Validate, insert, then drop the cached rules of every touched service.
async fn insert_rules(state: &AppState, rules: Vec<ScheduleRule>) -> AppResult<Vec<ScheduleRecord>> {
    if rules.is_empty() {
        return Err(AppError::BadRequest("Empty payload".to_string()));
    }

    for (index, rule) in rules.iter().enumerate() {
        if let Err(e) = rule.validate() {
            tracing::warn!(index = index, field = e.field(), error = %e, "Rejected schedule rule");
            return Err(e.into());
        }
    }

    let start = Instant::now();
    let created = state.db.create_schedules(&rules).await?;
    metrics::record_db_query("insert", start.elapsed().as_secs_f64());

    let mut service_ids: Vec<i64> = rules.iter().map(|rule| rule.service_id).collect();
    service_ids.sort_unstable();
    service_ids.dedup();
    state.cache.invalidate(&service_ids).await;

    tracing::info!(count = created.len(), ?service_ids, "Schedule rules created");

    Ok(created)
}

/// Create rules from an array
///
/// POST /api/v1/admin/schedules
///
/// # Request Body
/// ```json
/// [
///   { "service_id": 1, "day_of_week": 0, "start_time": "08:00", "end_time": "12:00",
///     "slot_minutes": 30, "capacity_per_slot": 3 }
/// ]
/// ```
pub async fn create_schedules(
    State(state): State<Arc<AppState>>,
    Json(rules): Json<Vec<ScheduleRule>>,
) -> AppResult<(StatusCode, Json<Vec<ScheduleRecord>>)> {
    let start = Instant::now();

    let created = insert_rules(&state, rules).await?;

    metrics::record_http_request(
        "POST",
        "/api/v1/admin/schedules",
        201,
        start.elapsed().as_secs_f64(),
    );

    Ok((StatusCode::CREATED, Json(created)))
}

/// Create rules from time blocks, Monday–Friday or one day each
///
/// POST /api/v1/admin/schedules/blocks
///
/// # Request Body
/// ```json
/// {
///   "service_id": 1,
///   "valid_from": "2025-06-01",
///   "weekdays_only": true,
///   "blocks": [
///     { "day_of_week": 0, "start_time": "08:00", "end_time": "12:00" },
///     { "day_of_week": 0, "start_time": "13:00", "end_time": "17:00" }
///   ]
/// }
/// ```
pub async fn create_schedule_blocks(
    State(state): State<Arc<AppState>>,
    Json(set): Json<ScheduleBlockSet>,
) -> AppResult<(StatusCode, Json<Vec<ScheduleRecord>>)> {
    let start = Instant::now();

    let created = insert_rules(&state, set.into_rules()).await?;

    metrics::record_http_request(
        "POST",
        "/api/v1/admin/schedules/blocks",
        201,
        start.elapsed().as_secs_f64(),
    );

    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /api/v1/admin/services
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewService>,
) -> AppResult<(StatusCode, Json<Service>)> {
    let start = Instant::now();

    new.validate()?;
    let service = state.db.create_service(&new).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/admin/services", 201, duration);
    metrics::record_db_query("insert", duration);

    tracing::info!(service_id = service.id, name = %service.name, "Service created");

    Ok((StatusCode::CREATED, Json(service)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use chrono::{DateTime, FixedOffset};

    async fn caller_from(header: Option<&str>) -> Result<CallerId, AppError> {
        let mut builder = Request::builder().uri("/api/v1/appointments/me");
        if let Some(value) = header {
            builder = builder.header("X-User-Id", value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CallerId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn caller_id_reads_uuid_header() {
        let id = Uuid::new_v4();
        let caller = caller_from(Some(&id.to_string())).await.unwrap();
        assert_eq!(caller, CallerId(id));
    }

    #[tokio::test]
    async fn caller_id_rejects_missing_or_malformed_header() {
        assert!(matches!(caller_from(None).await, Err(AppError::Unauthorized(_))));
        assert!(matches!(
            caller_from(Some("citizen-42")).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn booking_outcomes_label_each_rejection() {
        let start: DateTime<FixedOffset> = "2025-06-11T08:30:00+08:00".parse().unwrap();
        assert_eq!(
            booking_outcome(&AppError::SlotFull { slot_start: start, capacity: 3 }),
            "slot_full"
        );
        assert_eq!(booking_outcome(&AppError::BadRequest("x".into())), "invalid_slot");
        assert_eq!(booking_outcome(&AppError::Conflict("x".into())), "conflict");
        assert_eq!(booking_outcome(&AppError::Internal("x".into())), "error");
    }

    #[test]
    fn queue_params_require_a_department() {
        let params: QueueParams = serde_json::from_str(r#"{ "department_id": 3 }"#).unwrap();
        assert_eq!(params.department_id, 3);
        assert!(serde_json::from_str::<QueueParams>("{}").is_err());
    }

    #[test]
    fn slot_params_default_to_all_slots() {
        let params: SlotParams = serde_json::from_str(r#"{ "day": "2025-06-11" }"#).unwrap();
        assert!(!params.only_available);
    }
}
