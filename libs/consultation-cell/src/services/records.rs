use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    Actor, AuditAction, AuditEvent, ChatMessage, ConsultationRecords, ConsultationSession,
    DiagnosticTest, DiagnosticTestStatus, NewDiagnosticTest, NewPrescription, Prescription,
    RequestContext, Role, SessionStatus,
};
use crate::services::audit::AuditSink;
use crate::services::clock::Clock;
use crate::services::store::TransitionStore;

const MAX_MESSAGE_LENGTH: usize = 5000;

/// Append-only clinical records attached to a session: chat, prescriptions
/// and diagnostic tests. Writes are only legal while the session is ACTIVE.
pub struct ClinicalRecordService {
    store: Arc<dyn TransitionStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl ClinicalRecordService {
    pub fn new(store: Arc<dyn TransitionStore>, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self { store, audit, clock }
    }

    #[instrument(skip(self, ctx, text), fields(actor_id = %actor.id))]
    pub async fn send_message(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage, ConsultationError> {
        let session = self.load(session_id).await?;
        if !session.is_participant(actor) {
            return Err(ConsultationError::denied("Not a participant of this consultation"));
        }
        Self::require_active(&session)?;

        let text = text.trim();
        if text.is_empty() {
            return Err(ConsultationError::ValidationError("Message cannot be empty".to_string()));
        }
        if text.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(ConsultationError::ValidationError(format!(
                "Message must be at most {} characters",
                MAX_MESSAGE_LENGTH
            )));
        }

        if actor.role == Role::Patient && self.store.completed_payment(session_id).await?.is_none() {
            return Err(ConsultationError::precondition("Payment required before chatting"));
        }

        let now = self.clock.now();
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            sender_id: actor.id,
            sender_role: actor.role,
            message: text.to_string(),
            created_at: now,
        };
        self.store.insert_message(&message).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::SendMessage, "consultation_message", message.id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .add_metadata("session_id", session_id)
                    .add_metadata("message_length", text.chars().count()),
            )
            .await;

        Ok(message)
    }

    #[instrument(skip(self, ctx, prescription), fields(doctor_id = %actor.id))]
    pub async fn issue_prescription(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
        prescription: NewPrescription,
    ) -> Result<Prescription, ConsultationError> {
        let session = self.load_for_doctor(actor, session_id).await?;
        Self::validate_prescription(&prescription)?;

        let now = self.clock.now();
        let issued = Prescription {
            id: Uuid::new_v4(),
            session_id: session.id,
            doctor_id: actor.id,
            medications: prescription.medications,
            diagnosis: prescription.diagnosis.trim().to_string(),
            notes: prescription.notes,
            version: 1,
            previous_version_id: None,
            issued_at: now,
        };
        self.store.insert_prescription(&issued).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::CreatePrescription, "prescription", issued.id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .add_metadata("session_id", session.id)
                    .add_metadata("medication_count", issued.medications.len()),
            )
            .await;

        info!(session_id = %session.id, prescription_id = %issued.id, "Prescription issued");
        Ok(issued)
    }

    /// Writes a new version pointing at `prescription_id`. The earlier row is
    /// never modified, and only the latest version of a chain can be revised.
    #[instrument(skip(self, ctx, revision), fields(doctor_id = %actor.id))]
    pub async fn revise_prescription(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        prescription_id: Uuid,
        revision: NewPrescription,
    ) -> Result<Prescription, ConsultationError> {
        let previous = self
            .store
            .get_prescription(prescription_id)
            .await?
            .ok_or_else(|| ConsultationError::NotFound("Prescription".to_string()))?;
        let session = self.load_for_doctor(actor, previous.session_id).await?;
        Self::validate_prescription(&revision)?;

        let superseded = self
            .store
            .prescriptions(session.id)
            .await?
            .iter()
            .any(|p| p.previous_version_id == Some(previous.id));
        if superseded {
            return Err(ConsultationError::precondition("Prescription has already been revised"));
        }

        let now = self.clock.now();
        let revised = Prescription {
            id: Uuid::new_v4(),
            session_id: session.id,
            doctor_id: actor.id,
            medications: revision.medications,
            diagnosis: revision.diagnosis.trim().to_string(),
            notes: revision.notes,
            version: previous.version + 1,
            previous_version_id: Some(previous.id),
            issued_at: now,
        };
        self.store.insert_prescription(&revised).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::RevisePrescription, "prescription", revised.id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .add_metadata("session_id", session.id)
                    .add_metadata("previous_version_id", previous.id)
                    .add_metadata("version", revised.version),
            )
            .await;

        Ok(revised)
    }

    #[instrument(skip(self, ctx, test), fields(doctor_id = %actor.id))]
    pub async fn order_test(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
        test: NewDiagnosticTest,
    ) -> Result<DiagnosticTest, ConsultationError> {
        let session = self.load_for_doctor(actor, session_id).await?;

        let test_name = test.test_name.trim();
        if test_name.is_empty() {
            return Err(ConsultationError::ValidationError("Test name is required".to_string()));
        }

        let now = self.clock.now();
        let ordered = DiagnosticTest {
            id: Uuid::new_v4(),
            session_id: session.id,
            ordered_by: actor.id,
            test_name: test_name.to_string(),
            instructions: test.instructions,
            status: DiagnosticTestStatus::Ordered,
            ordered_at: now,
        };
        self.store.insert_test(&ordered).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::OrderTest, "diagnostic_test", ordered.id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .add_metadata("session_id", session.id),
            )
            .await;

        Ok(ordered)
    }

    pub async fn history(&self, actor: &Actor, session_id: Uuid) -> Result<ConsultationRecords, ConsultationError> {
        let session = self.load(session_id).await?;
        if !session.is_participant(actor) && actor.role != Role::Admin {
            return Err(ConsultationError::denied("Not a participant of this consultation"));
        }

        Ok(ConsultationRecords {
            messages: self.store.messages(session_id).await?,
            prescriptions: self.store.prescriptions(session_id).await?,
            diagnostic_tests: self.store.tests(session_id).await?,
            snapshot: self.store.snapshot(session_id).await?,
        })
    }

    async fn load(&self, session_id: Uuid) -> Result<ConsultationSession, ConsultationError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ConsultationError::NotFound("Consultation".to_string()))
    }

    async fn load_for_doctor(&self, actor: &Actor, session_id: Uuid) -> Result<ConsultationSession, ConsultationError> {
        actor.require_role(Role::Doctor)?;
        let session = self.load(session_id).await?;
        if !session.is_assigned_to(actor.id) {
            return Err(ConsultationError::denied("Not the assigned doctor for this consultation"));
        }
        Self::require_active(&session)?;
        Ok(session)
    }

    fn require_active(session: &ConsultationSession) -> Result<(), ConsultationError> {
        if session.status != SessionStatus::Active {
            return Err(ConsultationError::precondition(format!(
                "Consultation is {}, records can only be added while ACTIVE",
                session.status
            )));
        }
        Ok(())
    }

    fn validate_prescription(prescription: &NewPrescription) -> Result<(), ConsultationError> {
        if prescription.medications.is_empty() {
            return Err(ConsultationError::ValidationError(
                "At least one medication is required".to_string(),
            ));
        }
        if prescription.diagnosis.trim().is_empty() {
            return Err(ConsultationError::ValidationError("Diagnosis is required".to_string()));
        }
        Ok(())
    }
}
