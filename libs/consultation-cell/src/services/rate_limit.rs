use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::services::counter::CounterService;

/// Per-doctor acceptance limit on top of a shared counter.
///
/// A slot is taken optimistically with an increment. Callers that fail after
/// reserving must `release` the slot so that lost races do not burn quota.
#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterService>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterService>, limit: u64, window: Duration) -> Self {
        Self { counters, limit, window }
    }

    fn key(doctor_id: Uuid) -> String {
        format!("doctor:accept:{}", doctor_id)
    }

    pub async fn reserve(&self, doctor_id: Uuid) -> Result<RateLimitReservation, ConsultationError> {
        let key = Self::key(doctor_id);
        let count = self.counters.increment(&key, self.window).await?;

        if count > self.limit {
            if let Err(e) = self.counters.decrement(&key).await {
                warn!("Failed to undo over-limit increment on {}: {}", key, e);
            }
            debug!("Doctor {} over accept limit ({}/{})", doctor_id, count, self.limit);
            return Err(ConsultationError::RateLimited {
                limit: self.limit,
                window_seconds: self.window.as_secs(),
            });
        }

        Ok(RateLimitReservation {
            counters: self.counters.clone(),
            key,
            settled: false,
        })
    }

    pub async fn used(&self, doctor_id: Uuid) -> Result<u64, ConsultationError> {
        self.counters.current(&Self::key(doctor_id)).await
    }
}

/// A taken slot. Settle it with `commit` or `release`.
pub struct RateLimitReservation {
    counters: Arc<dyn CounterService>,
    key: String,
    settled: bool,
}

impl RateLimitReservation {
    pub fn commit(mut self) {
        self.settled = true;
    }

    pub async fn release(mut self) {
        self.settled = true;
        if let Err(e) = self.counters.decrement(&self.key).await {
            warn!("Failed to release rate limit slot {}: {}", self.key, e);
        }
    }
}

impl fmt::Debug for RateLimitReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitReservation")
            .field("key", &self.key)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for RateLimitReservation {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Rate limit slot {} dropped without commit or release", self.key);
        }
    }
}
