use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deadpool_redis::Pool;
use tokio::sync::Mutex;

use crate::error::ConsultationError;
use crate::services::clock::Clock;
use crate::services::redis_pool;

/// Shared windowed counters. A counter starts its window on the first
/// increment and resets when the window lapses.
#[async_trait]
pub trait CounterService: Send + Sync {
    /// Increments and returns the new value.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, ConsultationError>;

    /// Decrements and returns the new value. Never goes below zero.
    async fn decrement(&self, key: &str) -> Result<u64, ConsultationError>;

    async fn current(&self, key: &str) -> Result<u64, ConsultationError>;
}

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

const DECREMENT_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count <= 0 then
    return 0
end
return redis.call('DECR', KEYS[1])
"#;

pub struct RedisCounterService {
    pool: Pool,
    increment: redis::Script,
    decrement: redis::Script,
}

impl RedisCounterService {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            increment: redis::Script::new(INCREMENT_SCRIPT),
            decrement: redis::Script::new(DECREMENT_SCRIPT),
        }
    }

    fn key(key: &str) -> String {
        format!("counter:{}", key)
    }
}

#[async_trait]
impl CounterService for RedisCounterService {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let count: u64 = self
            .increment
            .key(Self::key(key))
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn decrement(&self, key: &str) -> Result<u64, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let count: i64 = self.decrement.key(Self::key(key)).invoke_async(&mut conn).await?;
        Ok(count.max(0) as u64)
    }

    async fn current(&self, key: &str) -> Result<u64, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let count: Option<i64> = redis::cmd("GET").arg(Self::key(key)).query_async(&mut conn).await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }
}

struct Window {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Process-local counters. Windows are measured against the injected clock.
pub struct InMemoryCounterService {
    windows: Mutex<HashMap<String, Window>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl CounterService for InMemoryCounterService {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, ConsultationError> {
        let now = self.clock.now();
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        let expires_at = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_insert(Window { count: 0, expires_at });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = expires_at;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn decrement(&self, key: &str) -> Result<u64, ConsultationError> {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        match windows.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.count = entry.count.saturating_sub(1);
                Ok(entry.count)
            }
            _ => Ok(0),
        }
    }

    async fn current(&self, key: &str) -> Result<u64, ConsultationError> {
        let now = self.clock.now();
        let windows = self.windows.lock().await;
        Ok(windows
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map_or(0, |entry| entry.count))
    }
}
