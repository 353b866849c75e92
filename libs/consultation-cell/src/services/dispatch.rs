use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use serde_json::json;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ConsultationError;
use crate::models::{
    DeadLetter, DispatchCommand, NotificationRequest, RelayConfig, ScheduleOutcome, ScheduledTask,
    TaskId, TaskPayload,
};
use crate::services::clock::Clock;
use crate::services::notification::NotificationDispatcher;
use crate::services::redis_pool;
use crate::services::scheduler::{backoff_factor, TaskScheduler};

/// FIFO of side effects produced by lifecycle transitions.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, command: DispatchCommand) -> Result<(), ConsultationError>;

    /// Waits up to `wait` for the next command.
    async fn dequeue(&self, wait: Duration) -> Result<Option<DispatchCommand>, ConsultationError>;

    async fn len(&self) -> Result<u64, ConsultationError>;

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), ConsultationError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ConsultationError>;
}

// ==============================================================================
// QUEUE IMPLEMENTATIONS
// ==============================================================================

#[derive(Default)]
pub struct InMemoryDispatchQueue {
    commands: Mutex<VecDeque<DispatchCommand>>,
    dead: Mutex<Vec<DeadLetter>>,
    ready: Notify,
}

impl InMemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, command: DispatchCommand) -> Result<(), ConsultationError> {
        self.commands.lock().await.push_back(command);
        self.ready.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<DispatchCommand>, ConsultationError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(command) = self.commands.lock().await.pop_front() {
                return Ok(Some(command));
            }
            if tokio::time::timeout_at(deadline, self.ready.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> Result<u64, ConsultationError> {
        Ok(self.commands.lock().await.len() as u64)
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), ConsultationError> {
        self.dead.lock().await.push(letter);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ConsultationError> {
        Ok(self.dead.lock().await.clone())
    }
}

const COMMAND_LIST: &str = "dispatch:commands";
const DEAD_LETTER_LIST: &str = "dispatch:dead_letters";

pub struct RedisDispatchQueue {
    pool: Pool,
}

impl RedisDispatchQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    async fn enqueue(&self, command: DispatchCommand) -> Result<(), ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let data = serde_json::to_string(&command)?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(COMMAND_LIST)
            .arg(data)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<DispatchCommand>, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        // BRPOP treats 0 as "block forever".
        let timeout = wait.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(COMMAND_LIST)
            .arg(timeout)
            .query_async(&mut conn)
            .await?;

        match popped {
            Some((_, data)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<u64, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let len: u64 = redis::cmd("LLEN").arg(COMMAND_LIST).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let data = serde_json::to_string(&letter)?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(DEAD_LETTER_LIST)
            .arg(data)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ConsultationError> {
        let mut conn = redis_pool::connection(&self.pool).await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(DEAD_LETTER_LIST)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        raw.iter()
            .map(|data| serde_json::from_str(data).map_err(ConsultationError::from))
            .collect()
    }
}

// ==============================================================================
// RELAY
// ==============================================================================

/// Turns queued commands into timers and notifications.
pub struct DispatchRelay {
    queue: Arc<dyn DispatchQueue>,
    notifier: Arc<dyn NotificationDispatcher>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl DispatchRelay {
    pub fn new(
        queue: Arc<dyn DispatchQueue>,
        notifier: Arc<dyn NotificationDispatcher>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            queue,
            notifier,
            scheduler,
            clock,
            config,
        }
    }

    pub fn worker_count(&self) -> u32 {
        self.config.worker_count
    }

    /// Worker loop. Checks the shutdown flag between dequeues so a popped
    /// command is never dropped mid-flight.
    pub async fn run(&self, worker_name: String, shutdown: watch::Receiver<bool>) {
        info!("Dispatch worker {} started", worker_name);

        while !*shutdown.borrow() {
            match self.queue.dequeue(self.config.dequeue_wait).await {
                Ok(Some(command)) => {
                    if let Err(e) = self.process(command).await {
                        error!("Dispatch worker {} failed to process command: {}", worker_name, e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Dispatch worker {} failed to dequeue: {}", worker_name, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Dispatch worker {} stopped", worker_name);
    }

    /// Processes everything currently queued. Returns the number of commands handled.
    pub async fn drain(&self) -> Result<usize, ConsultationError> {
        let mut handled = 0;
        while let Some(command) = self.queue.dequeue(Duration::ZERO).await? {
            self.process(command).await?;
            handled += 1;
        }
        Ok(handled)
    }

    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn process(&self, command: DispatchCommand) -> Result<(), ConsultationError> {
        match command {
            DispatchCommand::DoctorAccepted {
                session_id,
                patient_id,
                doctor_id,
                payment_due_at,
            } => {
                let task = ScheduledTask {
                    id: TaskId::payment_timeout(session_id),
                    payload: TaskPayload::PaymentTimeout { session_id },
                    run_at: payment_due_at,
                    attempt: 0,
                };
                match self.scheduler.schedule(task).await {
                    Ok(ScheduleOutcome::Scheduled) => {
                        debug!("Payment timeout for session {} scheduled by relay", session_id)
                    }
                    Ok(ScheduleOutcome::AlreadyScheduled) => {}
                    // Armed when the doctor accepted; this is only a confirmation.
                    Err(e) => warn!("Could not confirm payment timeout for session {}: {}", session_id, e),
                }

                self.deliver(NotificationRequest::sms(
                    patient_id,
                    "doctor-accepted",
                    json!({
                        "session_id": session_id,
                        "doctor_id": doctor_id,
                        "payment_due_at": payment_due_at,
                    }),
                ))
                .await
            }
            DispatchCommand::PaymentTimedOut { session_id, patient_id } => {
                self.deliver(NotificationRequest::sms(
                    patient_id,
                    "payment-timeout",
                    json!({ "session_id": session_id }),
                ))
                .await
            }
            DispatchCommand::SessionCancelled {
                session_id,
                patient_id,
                doctor_id,
            } => {
                let data = json!({ "session_id": session_id });
                self.deliver(NotificationRequest::sms(patient_id, "consultation-cancelled", data.clone()))
                    .await?;
                if let Some(doctor_id) = doctor_id {
                    self.deliver(NotificationRequest::sms(doctor_id, "consultation-cancelled", data))
                        .await?;
                }
                Ok(())
            }
            DispatchCommand::Notify { request } => self.deliver(request).await,
        }
    }

    /// Sends with exponential backoff; after the last attempt the request is
    /// dead-lettered and the command counts as handled.
    async fn deliver(&self, request: NotificationRequest) -> Result<(), ConsultationError> {
        let max_attempts = self.config.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.notifier.send(&request).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let backoff = self.config.base_backoff.saturating_mul(backoff_factor(attempt - 1));
                        warn!(
                            "Notification {} for user {} failed (attempt {}/{}), retrying in {:?}",
                            request.template, request.user_id, attempt, max_attempts, backoff
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!(
            "Notification {} for user {} dead-lettered after {} attempts",
            request.template, request.user_id, max_attempts
        );
        self.queue
            .dead_letter(DeadLetter {
                request,
                error: last_error,
                attempts: max_attempts,
                failed_at: self.clock.now(),
            })
            .await
    }
}
