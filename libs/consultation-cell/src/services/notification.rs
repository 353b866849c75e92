use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ConsultationError;
use crate::models::NotificationRequest;

/// Delivers one notification. Retries are the relay's job, not the dispatcher's.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<(), ConsultationError>;
}

/// Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LoggingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingNotificationDispatcher {
    async fn send(&self, request: &NotificationRequest) -> Result<(), ConsultationError> {
        info!(
            user_id = %request.user_id,
            channel = ?request.channel,
            template = %request.template,
            "Notification dispatched"
        );
        Ok(())
    }
}

/// Posts each notification as JSON to an external delivery service.
pub struct WebhookNotificationDispatcher {
    client: Client,
    url: String,
}

impl WebhookNotificationDispatcher {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotificationDispatcher {
    async fn send(&self, request: &NotificationRequest) -> Result<(), ConsultationError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| ConsultationError::DispatchError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsultationError::DispatchError(format!(
                "Notification webhook returned {}",
                status
            )));
        }

        debug!("Notification {} delivered to user {}", request.template, request.user_id);
        Ok(())
    }
}

/// Keeps delivered notifications in memory and can fail the first N sends.
#[derive(Default)]
pub struct RecordingNotificationDispatcher {
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn delivered(&self) -> Vec<NotificationRequest> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotificationDispatcher {
    async fn send(&self, request: &NotificationRequest) -> Result<(), ConsultationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ConsultationError::DispatchError("Simulated delivery failure".to_string()));
        }

        self.delivered.lock().await.push(request.clone());
        Ok(())
    }
}
