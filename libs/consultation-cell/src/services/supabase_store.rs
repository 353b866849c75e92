use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::supabase::{SupabaseClient, SupabaseError};

use crate::error::ConsultationError;
use crate::models::{
    ChatMessage, ConsultationSession, ConsultationSnapshot, DiagnosticTest, PaymentRecord,
    Prescription, SessionStatus, Transition,
};
use crate::services::store::TransitionStore;

const SESSIONS: &str = "/rest/v1/consultation_sessions";
const PAYMENTS: &str = "/rest/v1/consultation_payments";
const MESSAGES: &str = "/rest/v1/consultation_messages";
const PRESCRIPTIONS: &str = "/rest/v1/prescriptions";
const TESTS: &str = "/rest/v1/diagnostic_tests";
const SNAPSHOTS: &str = "/rest/v1/consultation_snapshots";

/// PostgREST-backed store. Conditional transitions are a single filtered
/// PATCH, so the database performs the compare-and-swap.
pub struct SupabaseTransitionStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseTransitionStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ConsultationError> {
        self.supabase
            .request(Method::GET, path, None, None)
            .await
            .map_err(ConsultationError::storage)
    }

    async fn insert<T: Serialize>(&self, table: &str, row: &T) -> Result<(), ConsultationError> {
        let body = serde_json::to_value(row)?;
        let _: Vec<Value> = self
            .supabase
            .request_returning(Method::POST, table, None, Some(body))
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn count(&self, path: &str) -> Result<u64, ConsultationError> {
        let rows: Vec<Value> = self.fetch(path).await?;
        Ok(rows.len() as u64)
    }
}

fn map_write_error(err: anyhow::Error) -> ConsultationError {
    match err.downcast_ref::<SupabaseError>() {
        Some(api) if api.is_conflict() => ConsultationError::IntegrityViolation(api.body.clone()),
        _ => ConsultationError::storage(&err),
    }
}

fn timestamp_filter(at: DateTime<Utc>) -> String {
    urlencoding::encode(&at.to_rfc3339_opts(SecondsFormat::Millis, true)).into_owned()
}

fn open_status_filter() -> String {
    let statuses: Vec<&str> = SessionStatus::open_statuses().iter().map(|s| s.as_str()).collect();
    format!("in.({})", statuses.join(","))
}

#[async_trait]
impl TransitionStore for SupabaseTransitionStore {
    async fn insert_session(&self, session: &ConsultationSession) -> Result<(), ConsultationError> {
        self.insert(SESSIONS, session).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ConsultationSession>, ConsultationError> {
        let path = format!("{}?id=eq.{}&select=*", SESSIONS, id);
        let rows: Vec<ConsultationSession> = self.fetch(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsultationSession>, ConsultationError> {
        let mut path = format!("{}?id=eq.{}&status=eq.{}", SESSIONS, id, transition.expected);
        if let Some(limit) = transition.due_at_or_before {
            path.push_str(&format!("&payment_due_at=lte.{}", timestamp_filter(limit)));
        }

        let body = transition.patch.to_row(now)?;
        let rows: Vec<ConsultationSession> = self
            .supabase
            .request_returning(Method::PATCH, &path, None, Some(body))
            .await
            .map_err(map_write_error)?;

        if rows.len() > 1 {
            warn!("Conditional update on session {} matched {} rows", id, rows.len());
        }
        let updated = rows.into_iter().next();
        debug!(
            "Transition {} -> {} on session {}: {}",
            transition.expected,
            transition.target(),
            id,
            if updated.is_some() { "applied" } else { "missed" }
        );
        Ok(updated)
    }

    async fn sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<ConsultationSession>, ConsultationError> {
        let path = format!("{}?status=eq.{}&order=created_at.asc", SESSIONS, status);
        self.fetch(&path).await
    }

    async fn count_with_status(&self, status: SessionStatus) -> Result<u64, ConsultationError> {
        self.count(&format!("{}?status=eq.{}&select=id", SESSIONS, status)).await
    }

    async fn count_open_for_patient(&self, patient_id: Uuid) -> Result<u64, ConsultationError> {
        let path = format!(
            "{}?patient_id=eq.{}&status={}&select=id",
            SESSIONS,
            patient_id,
            open_status_filter()
        );
        self.count(&path).await
    }

    async fn sessions_for_patient(
        &self,
        patient_id: Uuid,
    ) -> Result<Vec<ConsultationSession>, ConsultationError> {
        let path = format!("{}?patient_id=eq.{}&order=created_at.desc", SESSIONS, patient_id);
        self.fetch(&path).await
    }

    async fn sessions_for_doctor(
        &self,
        doctor_id: Uuid,
    ) -> Result<Vec<ConsultationSession>, ConsultationError> {
        let path = format!("{}?doctor_id=eq.{}&order=created_at.desc", SESSIONS, doctor_id);
        self.fetch(&path).await
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<(), ConsultationError> {
        self.insert(PAYMENTS, payment).await
    }

    async fn settle_payment(&self, payment: &PaymentRecord) -> Result<(), ConsultationError> {
        let path = format!("{}?id=eq.{}&status=eq.PENDING", PAYMENTS, payment.id);
        let body = serde_json::json!({
            "status": payment.status,
            "transaction_id": payment.transaction_id,
            "payment_method": payment.payment_method,
            "updated_at": payment.updated_at,
        });
        let rows: Vec<Value> = self
            .supabase
            .request_returning(Method::PATCH, &path, None, Some(body))
            .await
            .map_err(map_write_error)?;

        if rows.is_empty() {
            return Err(ConsultationError::IntegrityViolation(format!(
                "Payment {} is not pending",
                payment.id
            )));
        }
        Ok(())
    }

    async fn completed_payment(&self, session_id: Uuid) -> Result<Option<PaymentRecord>, ConsultationError> {
        let path = format!("{}?session_id=eq.{}&status=eq.COMPLETED&limit=1", PAYMENTS, session_id);
        let rows: Vec<PaymentRecord> = self.fetch(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn pending_payment(&self, session_id: Uuid) -> Result<Option<PaymentRecord>, ConsultationError> {
        let path = format!(
            "{}?session_id=eq.{}&status=eq.PENDING&order=created_at.desc&limit=1",
            PAYMENTS, session_id
        );
        let rows: Vec<PaymentRecord> = self.fetch(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), ConsultationError> {
        self.insert(MESSAGES, message).await
    }

    async fn messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, ConsultationError> {
        self.fetch(&format!("{}?session_id=eq.{}&order=created_at.asc", MESSAGES, session_id))
            .await
    }

    async fn insert_prescription(&self, prescription: &Prescription) -> Result<(), ConsultationError> {
        self.insert(PRESCRIPTIONS, prescription).await
    }

    async fn get_prescription(&self, id: Uuid) -> Result<Option<Prescription>, ConsultationError> {
        let rows: Vec<Prescription> = self.fetch(&format!("{}?id=eq.{}", PRESCRIPTIONS, id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn prescriptions(&self, session_id: Uuid) -> Result<Vec<Prescription>, ConsultationError> {
        self.fetch(&format!("{}?session_id=eq.{}&order=issued_at.asc", PRESCRIPTIONS, session_id))
            .await
    }

    async fn insert_test(&self, test: &DiagnosticTest) -> Result<(), ConsultationError> {
        self.insert(TESTS, test).await
    }

    async fn tests(&self, session_id: Uuid) -> Result<Vec<DiagnosticTest>, ConsultationError> {
        self.fetch(&format!("{}?session_id=eq.{}&order=ordered_at.asc", TESTS, session_id))
            .await
    }

    async fn insert_snapshot(&self, snapshot: &ConsultationSnapshot) -> Result<(), ConsultationError> {
        self.insert(SNAPSHOTS, snapshot).await
    }

    async fn snapshot(&self, session_id: Uuid) -> Result<Option<ConsultationSnapshot>, ConsultationError> {
        let rows: Vec<ConsultationSnapshot> = self
            .fetch(&format!("{}?session_id=eq.{}", SNAPSHOTS, session_id))
            .await?;
        Ok(rows.into_iter().next())
    }
}
