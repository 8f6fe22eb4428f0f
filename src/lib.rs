// =============================================================================
// APPOINTMENT SERVICE
// =============================================================================
// Appointment scheduling for the municipal citizen-services app:
//
// - expands weekly schedule rules into bookable slots with live availability
// - books slots under capacity, same-day and overlap rules
// - checks citizens in with their QR token and numbers the day's queue
// - lets admins manage services and schedule rules
// - exposes Prometheus metrics and caches schedule rules in Redis
// =============================================================================

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod scheduling;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::cache::ScheduleCache;
use crate::db::Database;
use crate::scheduling::{BookingGuard, ScheduleExpander};

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
/// Shared by every handler through `State<Arc<AppState>>`.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,

    /// Redis cache of schedule rules
    pub cache: ScheduleCache,

    pub metrics_handle: PrometheusHandle,

    /// Both use the configured default time zone
    pub expander: ScheduleExpander,
    pub guard: BookingGuard,
}

// -----------------------------------------------------------------------------
// ROUTER
// -----------------------------------------------------------------------------
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health & Readiness -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Services & Slots -----
        .route("/api/v1/services", get(handlers::list_services))
        .route(
            "/api/v1/services/:id/schedules",
            get(handlers::service_schedules),
        )
        .route("/api/v1/services/:id/slots", get(handlers::service_slots))
        // ----- Appointments -----
        .route("/api/v1/appointments", post(handlers::book_appointment))
        .route(
            "/api/v1/appointments/precheck",
            post(handlers::precheck_appointment),
        )
        .route("/api/v1/appointments/me", get(handlers::my_appointments))
        .route(
            "/api/v1/appointments/me/current",
            get(handlers::my_current_appointment),
        )
        .route(
            "/api/v1/appointments/:id/cancel",
            post(handlers::cancel_appointment),
        )
        .route(
            "/api/v1/appointments/:id/checkin",
            post(handlers::checkin_appointment),
        )
        .route("/api/v1/appointments/queue/now", get(handlers::queue_now))
        // ----- Admin -----
        .route(
            "/api/v1/admin/schedules",
            get(handlers::list_schedules).post(handlers::create_schedules),
        )
        .route(
            "/api/v1/admin/schedules/blocks",
            post(handlers::create_schedule_blocks),
        )
        .route("/api/v1/admin/services", post(handlers::create_service))
        // ----- Middleware -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
