// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics, scraped from GET /metrics.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Slots produced per slot query. Labels: service_id
pub const APPOINTMENT_SLOTS_GENERATED: &str = "appointment_slots_generated";

/// Labels: outcome (booked, slot_full, reject_same_day, reject_overlap, invalid_slot,
/// unknown_service, conflict, error)
pub const APPOINTMENT_BOOKINGS_TOTAL: &str = "appointment_bookings_total";

/// Labels: operation (select/insert/update/booking)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the Prometheus recorder globally and return its render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    // Slot counts per day: a handful up to a full day of 5-minute slots
    let slot_buckets = &[0.0, 1.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 288.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(APPOINTMENT_SLOTS_GENERATED.to_string()),
            slot_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_histogram!(
        APPOINTMENT_SLOTS_GENERATED,
        "Number of slots generated per slot query"
    );
    describe_counter!(
        APPOINTMENT_BOOKINGS_TOTAL,
        "Booking attempts by outcome"
    );
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "Redis operation latency in seconds"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_slots_generated(service_id: i64, count: usize) {
    histogram!(
        APPOINTMENT_SLOTS_GENERATED,
        "service_id" => service_id.to_string()
    )
    .record(count as f64);
}

/// Record a booking attempt
///
/// # Arguments
/// * `outcome` - `booked`, or the rejection code
pub fn record_booking(outcome: &str) {
    counter!(
        APPOINTMENT_BOOKINGS_TOTAL,
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
