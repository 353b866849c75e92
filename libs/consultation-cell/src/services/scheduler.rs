use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ConsultationError;
use crate::models::{CancelOutcome, ScheduleOutcome, ScheduledTask, SchedulerConfig, TaskId};
use crate::services::clock::Clock;
use crate::services::redis_pool;

const MAX_BACKOFF_DOUBLINGS: u32 = 16;

/// `2^exponent`, with the exponent capped so large attempt counts cannot overflow.
pub(crate) fn backoff_factor(exponent: u32) -> u32 {
    1 << exponent.min(MAX_BACKOFF_DOUBLINGS)
}

/// Durable delayed-task store.
///
/// Task ids are unique: scheduling an id that is already pending is a no-op.
/// `claim_due` removes what it returns, so a task is handed to one worker.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(&self, task: ScheduledTask) -> Result<ScheduleOutcome, ConsultationError>;

    /// Upserts the task, replacing any pending entry with the same id.
    async fn retry(&self, task: ScheduledTask) -> Result<(), ConsultationError>;

    async fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, ConsultationError>;

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, ConsultationError>;

    async fn get(&self, id: &TaskId) -> Result<Option<ScheduledTask>, ConsultationError>;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &ScheduledTask) -> Result<(), ConsultationError>;
}

// ==============================================================================
// IN-MEMORY SCHEDULER
// ==============================================================================

#[derive(Default)]
pub struct InMemoryTaskScheduler {
    tasks: Mutex<HashMap<TaskId, ScheduledTask>>,
}

impl InMemoryTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskScheduler for InMemoryTaskScheduler {
    async fn schedule(&self, task: ScheduledTask) -> Result<ScheduleOutcome, ConsultationError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Ok(ScheduleOutcome::AlreadyScheduled);
        }
        tasks.insert(task.id.clone(), task);
        Ok(ScheduleOutcome::Scheduled)
    }

    async fn retry(&self, task: ScheduledTask) -> Result<(), ConsultationError> {
        self.tasks.lock().await.insert(task.id.clone(), task);
        Ok(())
    }

    async fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, ConsultationError> {
        Ok(match self.tasks.lock().await.remove(id) {
            Some(_) => CancelOutcome::Cancelled,
            None => CancelOutcome::NotFound,
        })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, ConsultationError> {
        let mut tasks = self.tasks.lock().await;
        let mut due: Vec<ScheduledTask> = tasks.values().filter(|t| t.run_at <= now).cloned().collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at));
        due.truncate(limit);
        for task in &due {
            tasks.remove(&task.id);
        }
        Ok(due)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ScheduledTask>, ConsultationError> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }
}

// ==============================================================================
// REDIS SCHEDULER
// ==============================================================================

const DUE_SET: &str = "scheduler:due";
const TASK_PREFIX: &str = "scheduler:task:";

const SCHEDULE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
return 1
"#;

const UPSERT_SCRIPT: &str = r#"
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
return 1
"#;

const CANCEL_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
return removed
"#;

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local tasks = {}
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    local key = ARGV[3] .. id
    local data = redis.call('GET', key)
    redis.call('DEL', key)
    if data then
        table.insert(tasks, data)
    end
end
return tasks
"#;

/// Sorted set of due times plus one JSON value per task. Every mutation is a
/// Lua script, so concurrent workers never claim the same task twice.
pub struct RedisTaskScheduler {
    pool: Pool,
    schedule: redis::Script,
    upsert: redis::Script,
    cancel: redis::Script,
    claim: redis::Script,
}

impl RedisTaskScheduler {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            schedule: redis::Script::new(SCHEDULE_SCRIPT),
            upsert: redis::Script::new(UPSERT_SCRIPT),
            cancel: redis::Script::new(CANCEL_SCRIPT),
            claim: redis::Script::new(CLAIM_SCRIPT),
        }
    }

    fn task_key(id: &TaskId) -> String {
        format!("{}{}", TASK_PREFIX, id)
    }

    async fn write(&self, script: &redis::Script, task: &ScheduledTask) -> Result<i64, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let data = serde_json::to_string(task)?;
        let written: i64 = script
            .key(DUE_SET)
            .key(Self::task_key(&task.id))
            .arg(task.run_at.timestamp_millis())
            .arg(data)
            .arg(task.id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(written)
    }
}

#[async_trait]
impl TaskScheduler for RedisTaskScheduler {
    async fn schedule(&self, task: ScheduledTask) -> Result<ScheduleOutcome, ConsultationError> {
        Ok(match self.write(&self.schedule, &task).await? {
            1 => ScheduleOutcome::Scheduled,
            _ => ScheduleOutcome::AlreadyScheduled,
        })
    }

    async fn retry(&self, task: ScheduledTask) -> Result<(), ConsultationError> {
        self.write(&self.upsert, &task).await?;
        Ok(())
    }

    async fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let removed: i64 = self
            .cancel
            .key(DUE_SET)
            .key(Self::task_key(id))
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(if removed > 0 {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::NotFound
        })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let raw: Vec<String> = self
            .claim
            .key(DUE_SET)
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(TASK_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        let mut tasks = Vec::with_capacity(raw.len());
        for data in raw {
            match serde_json::from_str::<ScheduledTask>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => error!("Dropping unreadable scheduled task: {}", e),
            }
        }
        Ok(tasks)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ScheduledTask>, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(Self::task_key(id))
            .query_async(&mut conn)
            .await?;
        data.map(|raw| serde_json::from_str(&raw).map_err(ConsultationError::from))
            .transpose()
    }
}

// ==============================================================================
// WORKER
// ==============================================================================

/// Polls the scheduler and runs due tasks through the handler. Failed tasks
/// are retried with exponential backoff up to `max_attempts`.
pub struct SchedulerWorker {
    scheduler: Arc<dyn TaskScheduler>,
    handler: Arc<dyn TaskHandler>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl SchedulerWorker {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        handler: Arc<dyn TaskHandler>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            scheduler,
            handler,
            clock,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler worker started (poll every {:?})", self.config.poll_interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick().await {
                error!("Scheduler tick failed: {}", e);
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Scheduler worker stopped");
    }

    /// Runs one batch of due tasks and returns how many were handled.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize, ConsultationError> {
        let now = self.clock.now();
        let due = self.scheduler.claim_due(now, self.config.batch_size).await?;
        let claimed = due.len();

        for task in due {
            match self.handler.handle(&task).await {
                Ok(()) => debug!("Task {} completed", task.id),
                Err(e) => self.retry_or_drop(task, now, e).await,
            }
        }

        Ok(claimed)
    }

    async fn retry_or_drop(&self, task: ScheduledTask, now: DateTime<Utc>, err: ConsultationError) {
        let attempt = task.attempt + 1;
        if attempt >= self.config.max_attempts {
            error!("Task {} failed after {} attempts: {}", task.id, attempt, err);
            return;
        }

        let backoff = self
            .config
            .retry_backoff
            .checked_mul(backoff_factor(task.attempt) as i32)
            .unwrap_or(chrono::Duration::MAX);
        let run_at = now.checked_add_signed(backoff).unwrap_or(DateTime::<Utc>::MAX_UTC);
        warn!("Task {} failed (attempt {}), retrying in {}s: {}", task.id, attempt, backoff.num_seconds(), err);

        let retry = ScheduledTask {
            run_at,
            attempt,
            ..task
        };
        if let Err(e) = self.scheduler.retry(retry).await {
            error!("Failed to reschedule task: {}", e);
        }
    }
}
