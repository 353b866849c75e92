use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    ChatMessage, ConsultationSession, ConsultationSnapshot, DiagnosticTest, PaymentRecord,
    PaymentStatus, Prescription, SessionStatus, Transition,
};

/// Persistence seam for sessions and their records.
///
/// `transition` is the only way a session row changes after insert. It must be
/// a single conditional write: the patch lands only when the stored row still
/// satisfies the transition guard, and `None` means nothing matched. Clinical
/// records are append-only, so there are no update or delete methods for them.
#[async_trait]
pub trait TransitionStore: Send + Sync {
    async fn insert_session(&self, session: &ConsultationSession) -> Result<(), ConsultationError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<ConsultationSession>, ConsultationError>;

    async fn transition(
        &self,
        id: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsultationSession>, ConsultationError>;

    /// Sessions in `status`, oldest first.
    async fn sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<ConsultationSession>, ConsultationError>;

    async fn count_with_status(&self, status: SessionStatus) -> Result<u64, ConsultationError>;

    async fn count_open_for_patient(&self, patient_id: Uuid) -> Result<u64, ConsultationError>;

    /// Newest first.
    async fn sessions_for_patient(
        &self,
        patient_id: Uuid,
    ) -> Result<Vec<ConsultationSession>, ConsultationError>;

    /// Newest first.
    async fn sessions_for_doctor(
        &self,
        doctor_id: Uuid,
    ) -> Result<Vec<ConsultationSession>, ConsultationError>;

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<(), ConsultationError>;

    /// Settles a PENDING payment. Settled payments never change again.
    async fn settle_payment(&self, payment: &PaymentRecord) -> Result<(), ConsultationError>;

    async fn completed_payment(&self, session_id: Uuid) -> Result<Option<PaymentRecord>, ConsultationError>;

    /// A charge that was started but never settled.
    async fn pending_payment(&self, session_id: Uuid) -> Result<Option<PaymentRecord>, ConsultationError>;

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), ConsultationError>;

    async fn messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, ConsultationError>;

    async fn insert_prescription(&self, prescription: &Prescription) -> Result<(), ConsultationError>;

    async fn get_prescription(&self, id: Uuid) -> Result<Option<Prescription>, ConsultationError>;

    async fn prescriptions(&self, session_id: Uuid) -> Result<Vec<Prescription>, ConsultationError>;

    async fn insert_test(&self, test: &DiagnosticTest) -> Result<(), ConsultationError>;

    async fn tests(&self, session_id: Uuid) -> Result<Vec<DiagnosticTest>, ConsultationError>;

    async fn insert_snapshot(&self, snapshot: &ConsultationSnapshot) -> Result<(), ConsultationError>;

    async fn snapshot(&self, session_id: Uuid) -> Result<Option<ConsultationSnapshot>, ConsultationError>;
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, ConsultationSession>,
    payments: Vec<PaymentRecord>,
    messages: Vec<ChatMessage>,
    prescriptions: Vec<Prescription>,
    tests: Vec<DiagnosticTest>,
    snapshots: HashMap<Uuid, ConsultationSnapshot>,
}

/// Single-process store. One lock guards every table, so each call is atomic.
#[derive(Clone, Default)]
pub struct InMemoryTransitionStore {
    tables: Arc<Mutex<Tables>>,
    settle_failures: Arc<AtomicU32>,
}

impl InMemoryTransitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `failures` calls to `settle_payment` fail as if the
    /// database were unreachable.
    pub fn fail_next_settlements(&self, failures: u32) {
        self.settle_failures.store(failures, Ordering::SeqCst);
    }
}

fn newest_first(mut sessions: Vec<ConsultationSession>) -> Vec<ConsultationSession> {
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sessions
}

#[async_trait]
impl TransitionStore for InMemoryTransitionStore {
    async fn insert_session(&self, session: &ConsultationSession) -> Result<(), ConsultationError> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&session.id) {
            return Err(ConsultationError::IntegrityViolation(format!(
                "Session {} already exists",
                session.id
            )));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ConsultationSession>, ConsultationError> {
        Ok(self.tables.lock().await.sessions.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsultationSession>, ConsultationError> {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if !transition.is_satisfied_by(session) {
            return Ok(None);
        }
        transition.patch.apply(session, now);
        Ok(Some(session.clone()))
    }

    async fn sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<ConsultationSession>, ConsultationError> {
        let tables = self.tables.lock().await;
        let mut sessions: Vec<_> = tables
            .sessions
            .values()
            .filter(|session| session.status == status)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn count_with_status(&self, status: SessionStatus) -> Result<u64, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables.sessions.values().filter(|s| s.status == status).count() as u64)
    }

    async fn count_open_for_patient(&self, patient_id: Uuid) -> Result<u64, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.patient_id == patient_id && !s.status.is_terminal())
            .count() as u64)
    }

    async fn sessions_for_patient(
        &self,
        patient_id: Uuid,
    ) -> Result<Vec<ConsultationSession>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(newest_first(
            tables
                .sessions
                .values()
                .filter(|s| s.patient_id == patient_id)
                .cloned()
                .collect(),
        ))
    }

    async fn sessions_for_doctor(
        &self,
        doctor_id: Uuid,
    ) -> Result<Vec<ConsultationSession>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(newest_first(
            tables
                .sessions
                .values()
                .filter(|s| s.doctor_id == Some(doctor_id))
                .cloned()
                .collect(),
        ))
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<(), ConsultationError> {
        self.tables.lock().await.payments.push(payment.clone());
        Ok(())
    }

    async fn settle_payment(&self, payment: &PaymentRecord) -> Result<(), ConsultationError> {
        if self
            .settle_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConsultationError::StorageError("payments table unavailable".to_string()));
        }
        let mut tables = self.tables.lock().await;
        let stored = tables
            .payments
            .iter_mut()
            .find(|p| p.id == payment.id && p.status == PaymentStatus::Pending)
            .ok_or_else(|| {
                ConsultationError::IntegrityViolation(format!("Payment {} is not pending", payment.id))
            })?;
        *stored = payment.clone();
        Ok(())
    }

    async fn completed_payment(&self, session_id: Uuid) -> Result<Option<PaymentRecord>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.session_id == session_id && p.status == PaymentStatus::Completed)
            .cloned())
    }

    async fn pending_payment(&self, session_id: Uuid) -> Result<Option<PaymentRecord>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter()
            .rev()
            .find(|p| p.session_id == session_id && p.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), ConsultationError> {
        self.tables.lock().await.messages.push(message.clone());
        Ok(())
    }

    async fn messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables.messages.iter().filter(|m| m.session_id == session_id).cloned().collect())
    }

    async fn insert_prescription(&self, prescription: &Prescription) -> Result<(), ConsultationError> {
        self.tables.lock().await.prescriptions.push(prescription.clone());
        Ok(())
    }

    async fn get_prescription(&self, id: Uuid) -> Result<Option<Prescription>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables.prescriptions.iter().find(|p| p.id == id).cloned())
    }

    async fn prescriptions(&self, session_id: Uuid) -> Result<Vec<Prescription>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .prescriptions
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_test(&self, test: &DiagnosticTest) -> Result<(), ConsultationError> {
        self.tables.lock().await.tests.push(test.clone());
        Ok(())
    }

    async fn tests(&self, session_id: Uuid) -> Result<Vec<DiagnosticTest>, ConsultationError> {
        let tables = self.tables.lock().await;
        Ok(tables.tests.iter().filter(|t| t.session_id == session_id).cloned().collect())
    }

    async fn insert_snapshot(&self, snapshot: &ConsultationSnapshot) -> Result<(), ConsultationError> {
        let mut tables = self.tables.lock().await;
        if tables.snapshots.contains_key(&snapshot.session_id) {
            return Err(ConsultationError::IntegrityViolation(format!(
                "Snapshot for session {} already exists",
                snapshot.session_id
            )));
        }
        tables.snapshots.insert(snapshot.session_id, snapshot.clone());
        Ok(())
    }

    async fn snapshot(&self, session_id: Uuid) -> Result<Option<ConsultationSnapshot>, ConsultationError> {
        Ok(self.tables.lock().await.snapshots.get(&session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_transition_misses_when_guard_fails() {
        let store = InMemoryTransitionStore::new();
        let now = Utc::now();
        let session = ConsultationSession::new_waitlisted(Uuid::new_v4(), "Headache", now);
        store.insert_session(&session).await.unwrap();

        let paid = store.transition(session.id, &Transition::mark_paid(), now).await.unwrap();
        assert!(paid.is_none());

        let accept = Transition::accept(Uuid::new_v4(), now, now + Duration::minutes(15));
        let accepted = store.transition(session.id, &accept, now).await.unwrap().unwrap();
        assert_eq!(accepted.status, SessionStatus::Accepted);

        let again = store.transition(session.id, &accept, now).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_transition_on_unknown_session_is_a_miss() {
        let store = InMemoryTransitionStore::new();
        let result = store
            .transition(Uuid::new_v4(), &Transition::mark_paid(), Utc::now())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_written_once() {
        let store = InMemoryTransitionStore::new();
        let snapshot = ConsultationSnapshot {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            chief_complaint: "Rash".to_string(),
            final_diagnosis: None,
            outcome_notes: None,
            prescription_ids: vec![],
            test_ids: vec![],
            created_at: Utc::now(),
        };

        store.insert_snapshot(&snapshot).await.unwrap();
        assert!(matches!(
            store.insert_snapshot(&snapshot).await,
            Err(ConsultationError::IntegrityViolation(_))
        ));
    }
}
