// =============================================================================
// CACHE MODULE
// =============================================================================
// Redis cache of schedule rules, keyed per service. Rules change only when
// an admin creates new ones, which invalidates the affected keys.
//
// Cache failures never fail a request: reads fall through to PostgreSQL and
// failed writes are logged.
// =============================================================================

use std::time::Instant;

use redis::aio::ConnectionManager;
use redis::RedisResult;

use crate::metrics;
use crate::models::ScheduleRecord;

pub fn schedules_key(service_id: i64) -> String {
    format!("schedules:{service_id}")
}

#[derive(Clone)]
pub struct ScheduleCache {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl ScheduleCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }

    /// Cached rules, or `None` on a miss or any cache error.
    pub async fn get(&self, service_id: i64) -> Option<Vec<ScheduleRecord>> {
        let start = Instant::now();
        let cached = redis::cmd("GET")
            .arg(schedules_key(service_id))
            .query_async::<_, Option<String>>(&mut self.redis.clone())
            .await;
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        decode_cached(service_id, cached)
    }

    pub async fn put(&self, service_id: i64, records: &[ScheduleRecord]) {
        let json = match serde_json::to_string(records) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(service_id = service_id, error = %e, "Failed to serialize schedules for cache");
                return;
            }
        };

        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("SETEX")
            .arg(schedules_key(service_id))
            .arg(self.ttl_secs)
            .arg(json)
            .query_async(&mut self.redis.clone())
            .await;
        metrics::record_redis_operation("set", start.elapsed().as_secs_f64());

        if let Err(e) = result {
            tracing::warn!(service_id = service_id, error = %e, "Failed to cache schedules");
        }
    }

    pub async fn invalidate(&self, service_ids: &[i64]) {
        if service_ids.is_empty() {
            return;
        }
        let keys: Vec<String> = service_ids.iter().map(|id| schedules_key(*id)).collect();

        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut self.redis.clone())
            .await;
        metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());

        if let Err(e) = result {
            tracing::warn!(?service_ids, error = %e, "Failed to invalidate cached schedules");
        }
    }

    pub async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.redis.clone())
            .await
            .is_ok()
    }
}

/// Turn a GET reply into records. Errors and unreadable entries are logged
/// and treated as a miss.
fn decode_cached(service_id: i64, reply: RedisResult<Option<String>>) -> Option<Vec<ScheduleRecord>> {
    let json = match reply {
        Ok(hit) => hit?,
        Err(e) => {
            tracing::warn!(service_id = service_id, error = %e, "Failed to read cached schedules");
            return None;
        }
    };

    match serde_json::from_str(&json) {
        Ok(records) => Some(records),
        Err(e) => {
            tracing::warn!(service_id = service_id, error = %e, "Discarding unreadable cached schedules");
            None
        }
    }
}
