// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL persistence for services, schedule rules and appointments.
//
// The booking path is the authoritative enforcement point for slot capacity
// and the per-user booking rules: every check runs again inside one
// transaction, under locks, before the appointment row is written.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Appointment, AppointmentStatus, BookAppointmentRequest, QueueNowResponse, QueueTicket, QueueTicketStatus,
    ScheduleRecord,
};
use crate::scheduling::{
    pick_seat, BookingGuard, NewService, ScheduleBlock, ScheduleBlockSet, ScheduleExpander, ScheduleRule,
    Service,
};

// Column lists shared by the queries below
macro_rules! service_columns {
    () => {
        "id, department_id, name, description, duration_min, capacity_per_slot, is_active"
    };
}

macro_rules! rule_columns {
    () => {
        "service_id, day_of_week, start_time, end_time, slot_minutes, capacity_per_slot, valid_from, valid_to, timezone"
    };
}

macro_rules! ticket_columns {
    () => {
        "id, department_id, service_id, appointment_id, queue_date, number, status, called_at, created_at"
    };
}

macro_rules! appointment_columns {
    () => {
        "id, user_id, service_id, department_id, slot_date, slot_start, slot_end, status, \
         queue_number, qr_token, notes, created_at, updated_at"
    };
}

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables, indexes and the status enum if missing, then seed an
    /// empty database with sample services.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            DO $$ BEGIN
                CREATE TYPE appointment_status AS ENUM (
                    'booked', 'cancelled', 'checked_in', 'serving', 'done', 'no_show'
                );
            EXCEPTION
                WHEN duplicate_object THEN NULL;
            END $$
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create appointment_status type")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS appointment_services (
                id BIGSERIAL PRIMARY KEY,
                department_id BIGINT NOT NULL,
                name VARCHAR(255) UNIQUE NOT NULL,
                description TEXT,
                duration_min INTEGER NOT NULL DEFAULT 15,
                capacity_per_slot INTEGER NOT NULL DEFAULT 1,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT valid_duration CHECK (duration_min BETWEEN 5 AND 240),
                CONSTRAINT valid_capacity CHECK (capacity_per_slot BETWEEN 1 AND 50)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create appointment_services table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS appointment_schedules (
                id BIGSERIAL PRIMARY KEY,
                service_id BIGINT NOT NULL REFERENCES appointment_services(id) ON DELETE CASCADE,

                -- Monday = 0 ... Sunday = 6
                day_of_week SMALLINT NOT NULL,
                start_time TIME NOT NULL,
                end_time TIME NOT NULL,

                -- NULL = use the service default
                slot_minutes INTEGER,
                capacity_per_slot INTEGER,

                -- NULL = open-ended
                valid_from DATE,
                valid_to DATE,

                timezone VARCHAR(64),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT valid_day CHECK (day_of_week BETWEEN 0 AND 6),
                CONSTRAINT valid_time_range CHECK (start_time < end_time),
                CONSTRAINT valid_slot_minutes CHECK (slot_minutes BETWEEN 5 AND 240),
                CONSTRAINT valid_rule_capacity CHECK (capacity_per_slot BETWEEN 1 AND 50),
                CONSTRAINT valid_window CHECK (valid_from IS NULL OR valid_to IS NULL OR valid_from <= valid_to)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create appointment_schedules table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_schedules_service_day
            ON appointment_schedules(service_id, day_of_week)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create schedule index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS appointments (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID NOT NULL,
                service_id BIGINT NOT NULL REFERENCES appointment_services(id),
                department_id BIGINT NOT NULL,

                -- Local calendar day of slot_start
                slot_date DATE NOT NULL,
                slot_start TIMESTAMPTZ NOT NULL,
                slot_end TIMESTAMPTZ NOT NULL,

                status appointment_status NOT NULL DEFAULT 'booked',
                queue_number INTEGER,
                qr_token VARCHAR(64) NOT NULL,
                notes TEXT,

                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT valid_slot CHECK (slot_start < slot_end)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create appointments table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_appointments_service_start
            ON appointments(service_id, slot_start)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create appointment slot index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_appointments_user_start
            ON appointments(user_id, slot_start DESC)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create appointment user index")?;

        // One non-cancelled appointment per user per day
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_appointments_user_active_day
            ON appointments(user_id, slot_date)
            WHERE status <> 'cancelled'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create same-day booking index")?;

        sqlx::query(
            r#"
            DO $$ BEGIN
                CREATE TYPE queue_ticket_status AS ENUM ('waiting', 'serving', 'done', 'no_show');
            EXCEPTION
                WHEN duplicate_object THEN NULL;
            END $$
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create queue_ticket_status type")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_tickets (
                id BIGSERIAL PRIMARY KEY,
                department_id BIGINT NOT NULL,
                service_id BIGINT NOT NULL REFERENCES appointment_services(id),
                appointment_id UUID NOT NULL UNIQUE REFERENCES appointments(id),

                -- Numbers restart per department every day
                queue_date DATE NOT NULL,
                number INTEGER NOT NULL,

                status queue_ticket_status NOT NULL DEFAULT 'waiting',
                called_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT uq_queue_number UNIQUE (department_id, queue_date, number)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create queue_tickets table")?;

        self.seed_sample_data().await?;

        Ok(())
    }

    /// Seed sample services with weekday schedules
    async fn seed_sample_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM appointment_services")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        let sample_services = vec![
            (1, "Business Permit Renewal", 30, 3),
            (1, "Barangay Clearance", 15, 5),
            (2, "Community Tax Certificate", 15, 4),
            (3, "Civil Registry Copy Request", 20, 2),
        ];

        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).context("invalid seed time");
        let morning = (hm(8, 0)?, hm(12, 0)?);
        let afternoon = (hm(13, 0)?, hm(17, 0)?);

        for (department_id, name, duration_min, capacity_per_slot) in sample_services {
            let service = self
                .create_service(&NewService {
                    name: name.to_string(),
                    department_id,
                    description: None,
                    duration_min,
                    capacity_per_slot,
                    is_active: true,
                })
                .await?;

            let blocks = [morning, afternoon]
                .into_iter()
                .map(|(start_time, end_time)| ScheduleBlock {
                    day_of_week: 0,
                    start_time,
                    end_time,
                    slot_minutes: None,
                    capacity_per_slot: None,
                    timezone: None,
                })
                .collect();

            let rules = ScheduleBlockSet {
                service_id: service.id,
                valid_from: None,
                valid_to: None,
                weekdays_only: true,
                blocks,
            }
            .into_rules();

            self.create_schedules(&rules).await?;
        }

        tracing::info!("Seeded sample services and schedules");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SERVICES
    // -------------------------------------------------------------------------

    /// Active services, optionally for one department, ordered by name
    pub async fn list_services(&self, department_id: Option<i64>) -> Result<Vec<Service>> {
        let services = sqlx::query_as::<_, Service>(concat!(
            "SELECT ",
            service_columns!(),
            " FROM appointment_services
              WHERE is_active AND ($1::BIGINT IS NULL OR department_id = $1)
              ORDER BY name ASC"
        ))
        .bind(department_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch services")?;

        Ok(services)
    }

    pub async fn get_service(&self, id: i64) -> Result<Option<Service>> {
        let service = sqlx::query_as::<_, Service>(concat!(
            "SELECT ",
            service_columns!(),
            " FROM appointment_services WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch service")?;

        Ok(service)
    }

    /// Insert a service. Names are unique.
    pub async fn create_service(&self, new: &NewService) -> AppResult<Service> {
        sqlx::query_as::<_, Service>(concat!(
            "INSERT INTO appointment_services
                (department_id, name, description, duration_min, capacity_per_slot, is_active)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING ",
            service_columns!()
        ))
        .bind(new.department_id)
        .bind(new.name.trim())
        .bind(&new.description)
        .bind(new.duration_min)
        .bind(new.capacity_per_slot)
        .bind(new.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation_as(e, "Service name already exists"))
    }

    // -------------------------------------------------------------------------
    // SCHEDULE RULES
    // -------------------------------------------------------------------------

    /// All rules of a service, ordered by day then start time
    pub async fn schedules_for_service(&self, service_id: i64) -> Result<Vec<ScheduleRecord>> {
        let records = sqlx::query_as::<_, ScheduleRecord>(concat!(
            "SELECT id, ",
            rule_columns!(),
            " FROM appointment_schedules
              WHERE service_id = $1
              ORDER BY day_of_week ASC, start_time ASC, id ASC"
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch schedules")?;

        Ok(records)
    }

    /// Admin listing, filterable by department and/or service
    pub async fn list_schedules(
        &self,
        department_id: Option<i64>,
        service_id: Option<i64>,
    ) -> Result<Vec<ScheduleRecord>> {
        let records = sqlx::query_as::<_, ScheduleRecord>(
            r#"
            SELECT sch.id, sch.service_id, sch.day_of_week, sch.start_time, sch.end_time,
                   sch.slot_minutes, sch.capacity_per_slot, sch.valid_from, sch.valid_to,
                   sch.timezone
            FROM appointment_schedules sch
            JOIN appointment_services svc ON svc.id = sch.service_id
            WHERE ($1::BIGINT IS NULL OR svc.department_id = $1)
              AND ($2::BIGINT IS NULL OR sch.service_id = $2)
            ORDER BY sch.service_id ASC, sch.day_of_week ASC, sch.start_time ASC, sch.id ASC
            "#,
        )
        .bind(department_id)
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list schedules")?;

        Ok(records)
    }

    /// Insert rules atomically. Every referenced service must exist.
    /// Rules are expected to be validated by the caller.
    pub async fn create_schedules(&self, rules: &[ScheduleRule]) -> AppResult<Vec<ScheduleRecord>> {
        let mut tx = self.pool.begin().await?;

        let mut service_ids: Vec<i64> = rules.iter().map(|r| r.service_id).collect();
        service_ids.sort_unstable();
        service_ids.dedup();

        let existing: Vec<(i64,)> = sqlx::query_as("SELECT id FROM appointment_services WHERE id = ANY($1)")
            .bind(&service_ids[..])
            .fetch_all(&mut *tx)
            .await?;

        let missing: Vec<i64> = service_ids
            .iter()
            .copied()
            .filter(|id| !existing.iter().any(|(found,)| found == id))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::NotFound(format!("Unknown service_ids: {missing:?}")));
        }

        let mut created = Vec::with_capacity(rules.len());
        for rule in rules {
            let record = sqlx::query_as::<_, ScheduleRecord>(concat!(
                "INSERT INTO appointment_schedules (",
                rule_columns!(),
                ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING id, ",
                rule_columns!()
            ))
            .bind(rule.service_id)
            .bind(rule.day_of_week)
            .bind(rule.start_time)
            .bind(rule.end_time)
            .bind(rule.slot_minutes)
            .bind(rule.capacity_per_slot)
            .bind(rule.valid_from)
            .bind(rule.valid_to)
            .bind(&rule.timezone)
            .fetch_one(&mut *tx)
            .await?;

            created.push(record);
        }

        tx.commit().await?;

        Ok(created)
    }

    // -------------------------------------------------------------------------
    // AVAILABILITY
    // -------------------------------------------------------------------------

    /// Non-cancelled bookings of a service per slot start within [from, to)
    pub async fn booked_counts(
        &self,
        service_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<DateTime<Utc>, i64>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            r#"
            SELECT slot_start, COUNT(*) AS booked
            FROM appointments
            WHERE service_id = $1
              AND status <> 'cancelled'
              AND slot_start >= $2
              AND slot_start < $3
            GROUP BY slot_start
            "#,
        )
        .bind(service_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count booked slots")?;

        Ok(rows.into_iter().collect())
    }

    // -------------------------------------------------------------------------
    // APPOINTMENTS
    // -------------------------------------------------------------------------

    /// A user's appointments, newest first
    pub async fn appointments_for_user(&self, user_id: Uuid) -> Result<Vec<Appointment>> {
        let appointments = sqlx::query_as::<_, Appointment>(concat!(
            "SELECT ",
            appointment_columns!(),
            " FROM appointments WHERE user_id = $1 ORDER BY slot_start DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch appointments")?;

        Ok(appointments)
    }

    /// Earliest booked / checked-in / serving appointment that has not ended
    pub async fn current_appointment(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<Appointment>> {
        let appointment = sqlx::query_as::<_, Appointment>(concat!(
            "SELECT ",
            appointment_columns!(),
            " FROM appointments
              WHERE user_id = $1
                AND status IN ('booked', 'checked_in', 'serving')
                AND slot_end >= $2
              ORDER BY slot_start ASC
              LIMIT 1"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch current appointment")?;

        Ok(appointment)
    }

    /// The user's non-cancelled appointment on a calendar day, if any
    pub async fn active_appointment_on(&self, user_id: Uuid, day: NaiveDate) -> Result<Option<Appointment>> {
        let appointment = sqlx::query_as::<_, Appointment>(concat!(
            "SELECT ",
            appointment_columns!(),
            " FROM appointments
              WHERE user_id = $1 AND slot_date = $2 AND status <> 'cancelled'
              LIMIT 1"
        ))
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch same-day appointment")?;

        Ok(appointment)
    }

    /// Book a slot for `user_id`.
    ///
    /// Inside one transaction:
    /// 1. advisory lock on the user (serializes their bookings)
    /// 2. row lock on the service (serializes seat accounting)
    /// 3. regenerate the day's slots and find the requested one
    /// 4. booking guard against the user's appointments
    /// 5. capacity check against non-cancelled bookings at that start
    /// 6. insert; the partial unique index backs the same-day rule
    pub async fn book_appointment(
        &self,
        user_id: Uuid,
        request: &BookAppointmentRequest,
        expander: &ScheduleExpander,
        guard: &BookingGuard,
    ) -> AppResult<Appointment> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        let service = sqlx::query_as::<_, Service>(concat!(
            "SELECT ",
            service_columns!(),
            " FROM appointment_services WHERE id = $1 FOR UPDATE"
        ))
        .bind(request.service_id)
        .fetch_optional(&mut *tx)
        .await?
        .filter(|s| s.is_active)
        .ok_or_else(|| AppError::NotFound(format!("Service not found: {}", request.service_id)))?;

        let rules = sqlx::query_as::<_, ScheduleRule>(concat!(
            "SELECT ",
            rule_columns!(),
            " FROM appointment_schedules WHERE service_id = $1 ORDER BY id ASC"
        ))
        .bind(service.id)
        .fetch_all(&mut *tx)
        .await?;

        let mut matching = expander.slots_starting_at(&rules, &service, &request.slot_start)?;
        if matching.is_empty() {
            return Err(AppError::BadRequest(format!(
                "No bookable slot starts at {}",
                request.slot_start.to_rfc3339()
            )));
        }

        let on_date = guard.calendar_date(&request.slot_start);
        let existing = sqlx::query_as::<_, Appointment>(concat!(
            "SELECT ",
            appointment_columns!(),
            " FROM appointments WHERE user_id = $1 ORDER BY slot_start ASC"
        ))
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        if let Some(rejection) = AppError::from_decision(guard.can_book(&existing, &matching[0], on_date)) {
            return Err(rejection);
        }

        let slot_start = matching[0].start_utc();
        let (taken,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM appointments
            WHERE service_id = $1 AND slot_start = $2 AND status <> 'cancelled'
            "#,
        )
        .bind(service.id)
        .bind(slot_start)
        .fetch_one(&mut *tx)
        .await?;

        let slot = pick_seat(&mut matching, taken).map_err(|full| AppError::SlotFull {
            slot_start: request.slot_start,
            capacity: full.capacity,
        })?;

        let inserted = sqlx::query_as::<_, Appointment>(concat!(
            "INSERT INTO appointments
                (user_id, service_id, department_id, slot_date, slot_start, slot_end, status, qr_token, notes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING ",
            appointment_columns!()
        ))
        .bind(user_id)
        .bind(service.id)
        .bind(service.department_id)
        .bind(on_date)
        .bind(slot.start_utc())
        .bind(slot.end_utc())
        .bind(AppointmentStatus::Booked)
        .bind(Uuid::new_v4().simple().to_string())
        .bind(&request.notes)
        .fetch_one(&mut *tx)
        .await;

        let appointment = match inserted {
            Ok(appointment) => appointment,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // A concurrent booking for the same day won the index
                tx.rollback().await?;
                let winner = self.active_appointment_on(user_id, on_date).await?;
                return Err(same_day_rejection(winner));
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;

        Ok(appointment)
    }

    /// Cancel one of the user's own appointments. Only `booked` can be cancelled.
    pub async fn cancel_appointment(&self, user_id: Uuid, id: Uuid) -> AppResult<Appointment> {
        let mut tx = self.pool.begin().await?;

        let appointment = sqlx::query_as::<_, Appointment>(concat!(
            "SELECT ",
            appointment_columns!(),
            " FROM appointments WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .filter(|a| a.user_id == user_id)
        .ok_or_else(|| AppError::NotFound(format!("Appointment not found: {id}")))?;

        if appointment.status != AppointmentStatus::Booked {
            return Err(AppError::BadRequest(format!(
                "Cannot cancel an appointment in status {:?}",
                appointment.status
            )));
        }

        let cancelled = sqlx::query_as::<_, Appointment>(concat!(
            "UPDATE appointments
             SET status = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING ",
            appointment_columns!()
        ))
        .bind(id)
        .bind(AppointmentStatus::Cancelled)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(cancelled)
    }

    // -------------------------------------------------------------------------
    // CHECK-IN & QUEUE
    // -------------------------------------------------------------------------

    /// Check an appointment in with its QR token and issue a queue ticket.
    ///
    /// The ticket takes the next number of the department's queue on
    /// `queue_date`. Checking in again returns the ticket already issued.
    pub async fn check_in(&self, id: Uuid, qr_token: &str, queue_date: NaiveDate) -> AppResult<QueueTicket> {
        let mut tx = self.pool.begin().await?;

        let appointment = sqlx::query_as::<_, Appointment>(concat!(
            "SELECT ",
            appointment_columns!(),
            " FROM appointments WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Appointment not found: {id}")))?;

        ensure_can_check_in(&appointment, qr_token)?;

        let issued = sqlx::query_as::<_, QueueTicket>(concat!(
            "SELECT ",
            ticket_columns!(),
            " FROM queue_tickets WHERE appointment_id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(ticket) = issued {
            tx.commit().await?;
            return Ok(ticket);
        }

        // Serializes numbering per department and day
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("queue:{}:{}", appointment.department_id, queue_date))
            .execute(&mut *tx)
            .await?;

        let (number,): (i32,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(number), 0) + 1
            FROM queue_tickets
            WHERE department_id = $1 AND queue_date = $2
            "#,
        )
        .bind(appointment.department_id)
        .bind(queue_date)
        .fetch_one(&mut *tx)
        .await?;

        let ticket = sqlx::query_as::<_, QueueTicket>(concat!(
            "INSERT INTO queue_tickets (department_id, service_id, appointment_id, queue_date, number, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING ",
            ticket_columns!()
        ))
        .bind(appointment.department_id)
        .bind(appointment.service_id)
        .bind(id)
        .bind(queue_date)
        .bind(number)
        .bind(QueueTicketStatus::Waiting)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE appointments
            SET status = $2, queue_number = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(AppointmentStatus::CheckedIn)
        .bind(number)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ticket)
    }

    /// Now-serving number and waiting count of a department's queue
    pub async fn queue_now(&self, department_id: i64, queue_date: NaiveDate) -> Result<QueueNowResponse> {
        let now_serving: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT number
            FROM queue_tickets
            WHERE department_id = $1 AND queue_date = $2 AND status = 'serving'
            ORDER BY called_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(department_id)
        .bind(queue_date)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch now-serving ticket")?;

        let (waiting,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM queue_tickets
            WHERE department_id = $1 AND queue_date = $2 AND status = 'waiting'
            "#,
        )
        .bind(department_id)
        .bind(queue_date)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count waiting tickets")?;

        Ok(QueueNowResponse {
            department_id,
            date: queue_date,
            now_serving: now_serving.map(|(number,)| number),
            waiting,
        })
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// The QR token must match before the status is even looked at.
fn ensure_can_check_in(appointment: &Appointment, qr_token: &str) -> AppResult<()> {
    if appointment.qr_token != qr_token {
        return Err(AppError::Unauthorized("QR token invalid".to_string()));
    }
    if !appointment.status.can_check_in() {
        return Err(AppError::BadRequest(format!(
            "Cannot check in from status {:?}",
            appointment.status
        )));
    }
    Ok(())
}

/// 409 for a booking refused by the same-day index. `winner` is the
/// appointment that holds the day, when it could be read back.
fn same_day_rejection(winner: Option<Appointment>) -> AppError {
    match winner {
        Some(existing) => AppError::AlreadyBookedSameDay(Box::new(existing)),
        None => AppError::Conflict("Booking changed concurrently, please retry".to_string()),
    }
}

fn unique_violation_as(err: sqlx::Error, message: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::Conflict(message.to_string()),
        _ => AppError::Database(err),
    }
}
