use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{AuditAction, AuditEvent};

/// Audit writes are best effort: a failing sink is logged and never fails the
/// operation being audited.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

fn log_to_tracing(event: &AuditEvent) {
    match event.action {
        AuditAction::DuplicatePaymentAttempt | AuditAction::PaymentFailed => {
            warn!(
                event_id = %event.event_id,
                actor_id = ?event.actor_id,
                action = ?event.action,
                entity_type = %event.entity_type,
                entity_id = ?event.entity_id,
                ip_address = ?event.ip_address,
                "Audit event"
            );
        }
        _ => {
            info!(
                event_id = %event.event_id,
                actor_id = ?event.actor_id,
                action = ?event.action,
                entity_type = %event.entity_type,
                entity_id = ?event.entity_id,
                fields = ?event.field_names_changed,
                "Audit event"
            );
        }
    }
}

/// Logs every event and keeps the most recent ones in a bounded buffer.
pub struct BufferedAuditSink {
    buffer: RwLock<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl BufferedAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub async fn entries(&self) -> Vec<AuditEvent> {
        self.buffer.read().await.iter().cloned().collect()
    }

    pub async fn entries_for(&self, entity_id: Uuid) -> Vec<AuditEvent> {
        self.buffer
            .read()
            .await
            .iter()
            .filter(|event| event.entity_id == Some(entity_id))
            .cloned()
            .collect()
    }
}

impl Default for BufferedAuditSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl AuditSink for BufferedAuditSink {
    async fn record(&self, event: AuditEvent) {
        log_to_tracing(&event);

        let mut buffer = self.buffer.write().await;
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }
}

/// Persists events to the `audit_logs` table.
pub struct SupabaseAuditSink {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseAuditSink {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl AuditSink for SupabaseAuditSink {
    async fn record(&self, event: AuditEvent) {
        log_to_tracing(&event);

        let body = match serde_json::to_value(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize audit event {}: {}", event.event_id, e);
                return;
            }
        };

        let result: anyhow::Result<Vec<Value>> = self
            .supabase
            .request_returning(Method::POST, "/rest/v1/audit_logs", None, Some(body))
            .await;
        if let Err(e) = result {
            warn!("Failed to persist audit event {}: {}", event.event_id, e);
        }
    }
}
