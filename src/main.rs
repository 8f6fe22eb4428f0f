// =============================================================================
// APPOINTMENT SERVICE - Main Entry Point
// =============================================================================
// Startup: .env → tracing → config → metrics → PostgreSQL (migrations and
// seed) → Redis → router → serve.
// =============================================================================

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use appointment_service::cache::ScheduleCache;
use appointment_service::config::Config;
use appointment_service::db::Database;
use appointment_service::metrics::setup_metrics;
use appointment_service::scheduling::{BookingGuard, ScheduleExpander};
use appointment_service::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // Example: RUST_LOG=info,appointment_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,appointment_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Appointment Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        default_timezone = %config.default_timezone,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    // ConnectionManager reconnects on its own
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    let state = Arc::new(AppState {
        db,
        cache: ScheduleCache::new(redis_conn, config.schedule_cache_ttl_secs),
        metrics_handle,
        expander: ScheduleExpander::new(config.default_timezone),
        guard: BookingGuard::new(config.default_timezone),
    });

    // -------------------------------------------------------------------------
    // STEP 8: Build routes
    // -------------------------------------------------------------------------
    let app = build_router(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Appointment Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
