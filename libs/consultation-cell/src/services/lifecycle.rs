use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    AcceptedConsultation, Actor, AuditAction, AuditEvent, CloseConsultationRequest, ConsentRecord,
    ConsultationSession, ConsultationSnapshot, DispatchCommand, LifecycleConfig, PaymentReceipt,
    PaymentRecord, PaymentRequest, PaymentStatus, QueueEntry, QueuePosition, QueueView,
    RequestContext, Role, ScheduledTask, SessionStatus, TaskId, TaskPayload, TimeoutOutcome,
    Transition,
};
use crate::services::audit::AuditSink;
use crate::services::clock::Clock;
use crate::services::counter::CounterService;
use crate::services::dispatch::DispatchQueue;
use crate::services::payment::PaymentProvider;
use crate::services::rate_limit::RateLimiter;
use crate::services::scheduler::{TaskHandler, TaskScheduler};
use crate::services::store::TransitionStore;

const MAX_COMPLAINT_LENGTH: usize = 2000;
const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(25);
const ENTITY: &str = "consultation_session";

/// Collaborators the engine is built from.
#[derive(Clone)]
pub struct LifecycleComponents {
    pub store: Arc<dyn TransitionStore>,
    pub counters: Arc<dyn CounterService>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub dispatch: Arc<dyn DispatchQueue>,
    pub audit: Arc<dyn AuditSink>,
    pub payments: Arc<dyn PaymentProvider>,
    pub clock: Arc<dyn Clock>,
}

/// The consultation state machine.
///
/// Every status change is a conditional write against the store; reads are
/// only used to pick an error or to authorize. Side effects that follow a
/// successful write are either compensated on failure (accept, pay) or are
/// best effort (task cancellation, notifications, audit).
pub struct LifecycleEngine {
    store: Arc<dyn TransitionStore>,
    rate_limiter: RateLimiter,
    scheduler: Arc<dyn TaskScheduler>,
    dispatch: Arc<dyn DispatchQueue>,
    audit: Arc<dyn AuditSink>,
    payments: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new(components: LifecycleComponents, config: LifecycleConfig) -> Self {
        let rate_limiter = RateLimiter::new(
            components.counters,
            config.accept_rate_limit,
            config.accept_rate_window,
        );

        Self {
            store: components.store,
            rate_limiter,
            scheduler: components.scheduler,
            dispatch: components.dispatch,
            audit: components.audit,
            payments: components.payments,
            clock: components.clock,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ==========================================================================
    // TRANSITIONS
    // ==========================================================================

    #[instrument(skip(self, ctx, chief_complaint), fields(patient_id = %actor.id))]
    pub async fn create_consultation(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        chief_complaint: &str,
    ) -> Result<ConsultationSession, ConsultationError> {
        actor.require_role(Role::Patient)?;

        let complaint = chief_complaint.trim();
        if complaint.is_empty() {
            return Err(ConsultationError::ValidationError("Chief complaint is required".to_string()));
        }
        if complaint.chars().count() > MAX_COMPLAINT_LENGTH {
            return Err(ConsultationError::ValidationError(format!(
                "Chief complaint must be at most {} characters",
                MAX_COMPLAINT_LENGTH
            )));
        }

        // Count-then-insert: concurrent creates may overshoot slightly.
        let waitlisted = self.store.count_with_status(SessionStatus::Waitlisted).await?;
        if waitlisted >= self.config.max_queue_size {
            return Err(ConsultationError::CapacityExceeded {
                resource: "Consultation queue".to_string(),
                current: waitlisted,
                max: self.config.max_queue_size,
            });
        }

        let open = self.store.count_open_for_patient(actor.id).await?;
        if open >= self.config.max_open_sessions_per_patient {
            return Err(ConsultationError::CapacityExceeded {
                resource: "Open consultations".to_string(),
                current: open,
                max: self.config.max_open_sessions_per_patient,
            });
        }

        let now = self.clock.now();
        let session = ConsultationSession::new_waitlisted(actor.id, complaint, now);
        self.store.insert_session(&session).await?;

        self.audit
            .record(
                AuditEvent::new(AuditAction::CreateConsultation, ENTITY, session.id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status", "chief_complaint"])
                    .add_metadata("queue_length", waitlisted + 1),
            )
            .await;

        info!(session_id = %session.id, "Consultation created");
        Ok(session)
    }

    #[instrument(skip(self, ctx), fields(doctor_id = %actor.id))]
    pub async fn accept(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<AcceptedConsultation, ConsultationError> {
        actor.require_role(Role::Doctor)?;
        self.load(session_id).await?;

        let reservation = self.rate_limiter.reserve(actor.id).await?;

        let now = self.clock.now();
        let payment_due_at = now + self.config.payment_deadline;
        let transition = Transition::accept(actor.id, now, payment_due_at);

        let accepted = match self.store.transition(session_id, &transition, now).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                reservation.release().await;
                debug!(session_id = %session_id, "Lost accept race");
                return Err(self
                    .explain_miss(session_id, "Consultation already accepted by another doctor or no longer in queue")
                    .await);
            }
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };

        if let Err(e) = self.arm_payment_deadline(&accepted, payment_due_at).await {
            error!(session_id = %session_id, "Failed to arm payment deadline, reverting acceptance: {}", e);
            self.undo_accept(session_id).await;
            reservation.release().await;
            return Err(e);
        }
        reservation.commit();

        self.audit
            .record(
                AuditEvent::new(AuditAction::ConsultationAccepted, ENTITY, session_id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status", "doctor_id", "accepted_at", "accepted_by", "payment_due_at"])
                    .add_metadata("patient_id", accepted.patient_id),
            )
            .await;

        info!(session_id = %session_id, "Consultation accepted, payment due at {}", payment_due_at);
        Ok(AcceptedConsultation {
            id: accepted.id,
            status: accepted.status,
            doctor_id: actor.id,
            accepted_at: now,
            payment_due_at,
        })
    }

    #[instrument(skip(self, ctx), fields(actor_id = %actor.id))]
    pub async fn pay(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<PaymentReceipt, ConsultationError> {
        let session = self.load(session_id).await?;
        Self::require_owner_or_admin(actor, &session)?;

        let now = self.clock.now();
        if let Some(existing) = self.store.completed_payment(session_id).await? {
            self.audit
                .record(
                    AuditEvent::new(AuditAction::DuplicatePaymentAttempt, "consultation_payment", existing.id, now)
                        .by(actor.id)
                        .with_context(ctx)
                        .add_metadata("session_id", session_id),
                )
                .await;
            info!(session_id = %session_id, "Payment already completed");
            return Ok(PaymentReceipt::AlreadyPaid { payment_id: existing.id });
        }

        if session.status == SessionStatus::Paid {
            if let Some(pending) = self.store.pending_payment(session_id).await? {
                info!(session_id = %session_id, payment_id = %pending.id, "Resuming unsettled payment");
                let payment_due_at = session.payment_due_at.unwrap_or(now);
                return self.complete_charge(actor, ctx, pending, payment_due_at).await;
            }
        }

        if session.status != SessionStatus::Accepted {
            return Err(ConsultationError::precondition(format!(
                "Consultation is {}, payment requires ACCEPTED",
                session.status
            )));
        }
        let payment_due_at = session
            .payment_due_at
            .unwrap_or(now + self.config.payment_deadline);
        if payment_due_at < now {
            return Err(ConsultationError::precondition("Payment deadline has passed"));
        }

        if self.store.transition(session_id, &Transition::mark_paid(), now).await?.is_none() {
            return Err(self.explain_miss(session_id, "Consultation is no longer awaiting payment").await);
        }

        let request = PaymentRequest {
            session_id,
            patient_id: session.patient_id,
            amount: self.config.consultation_fee,
            currency: self.config.currency.clone(),
        };
        let pending = PaymentRecord::pending(&request, now);
        if let Err(e) = self.store.insert_payment(&pending).await {
            self.restore_unpaid(session_id, payment_due_at).await;
            return Err(e);
        }

        self.complete_charge(actor, ctx, pending, payment_due_at).await
    }

    /// Charges a PENDING payment of a session already marked PAID and settles
    /// it. The provider call is keyed by session, so repeating it after a
    /// failed settle does not charge twice.
    async fn complete_charge(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        pending: PaymentRecord,
        payment_due_at: DateTime<Utc>,
    ) -> Result<PaymentReceipt, ConsultationError> {
        let session_id = pending.session_id;
        let request = PaymentRequest {
            session_id,
            patient_id: pending.patient_id,
            amount: pending.amount,
            currency: pending.currency.clone(),
        };

        let outcome = match self.payments.charge(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failed = pending.decline(self.clock.now());
                self.fail_payment(actor, ctx, &failed, payment_due_at, &e.to_string()).await;
                return Err(e);
            }
        };

        let settled = pending.settle(&outcome, self.clock.now());
        if outcome.status != PaymentStatus::Completed {
            self.fail_payment(actor, ctx, &settled, payment_due_at, "declined").await;
            return Err(ConsultationError::PaymentFailed("Payment was declined".to_string()));
        }

        if let Err(e) = self.settle_with_retry(&settled).await {
            error!(
                session_id = %session_id,
                transaction_id = %outcome.transaction_id,
                "Charge succeeded but payment record could not be completed, left PENDING: {}",
                e
            );
            return Err(e);
        }

        self.cancel_payment_deadline(session_id).await;

        self.audit
            .record(
                AuditEvent::new(AuditAction::PaymentCompleted, "consultation_payment", settled.id, self.clock.now())
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status"])
                    .add_metadata("session_id", session_id)
                    .add_metadata("amount", settled.amount)
                    .add_metadata("method", &outcome.method),
            )
            .await;

        info!(session_id = %session_id, "Payment completed");
        Ok(PaymentReceipt::Paid {
            payment_id: settled.id,
            transaction_id: outcome.transaction_id,
        })
    }

    async fn settle_with_retry(&self, settled: &PaymentRecord) -> Result<(), ConsultationError> {
        let mut backoff = SETTLE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.store.settle_payment(settled).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SETTLE_ATTEMPTS => {
                    warn!(payment_id = %settled.id, attempt, "Failed to settle payment, retrying: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    // An earlier attempt may have landed without its response.
                    if let Ok(Some(done)) = self.store.completed_payment(settled.session_id).await {
                        if done.id == settled.id {
                            return Ok(());
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    #[instrument(skip(self, ctx), fields(actor_id = %actor.id))]
    pub async fn cancel_payment(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        let session = self.load(session_id).await?;
        Self::require_owner_or_admin(actor, &session)?;

        let now = self.clock.now();
        let reverted = match self
            .store
            .transition(session_id, &Transition::release_to_queue(), now)
            .await?
        {
            Some(session) => session,
            None => return Err(self.explain_miss(session_id, "Consultation is not awaiting payment").await),
        };

        self.cancel_payment_deadline(session_id).await;

        self.audit
            .record(
                AuditEvent::new(AuditAction::PaymentCancelled, ENTITY, session_id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status", "doctor_id", "accepted_at", "accepted_by", "payment_due_at"])
                    .add_metadata("previous_doctor_id", session.doctor_id),
            )
            .await;

        info!(session_id = %session_id, "Payment cancelled, consultation returned to queue");
        Ok(reverted)
    }

    #[instrument(skip(self, ctx), fields(doctor_id = %actor.id))]
    pub async fn start_session(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        actor.require_role(Role::Doctor)?;
        let session = self.load(session_id).await?;
        Self::require_assigned(actor, &session)?;

        if session.status != SessionStatus::Paid {
            return Err(ConsultationError::precondition(format!(
                "Consultation is {}, starting requires PAID",
                session.status
            )));
        }
        if self.store.completed_payment(session_id).await?.is_none() {
            return Err(ConsultationError::precondition("No completed payment for this consultation"));
        }

        let now = self.clock.now();
        let consent = ConsentRecord {
            version: self.config.consent_version.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            given_at: now,
        };

        let started = match self.store.transition(session_id, &Transition::start(now, consent), now).await? {
            Some(session) => session,
            None => return Err(self.explain_miss(session_id, "Consultation is not ready to start").await),
        };

        self.audit
            .record(
                AuditEvent::new(AuditAction::StartSession, ENTITY, session_id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status", "started_at", "consent"])
                    .add_metadata("consent_version", &self.config.consent_version),
            )
            .await;

        info!(session_id = %session_id, "Consultation started");
        Ok(started)
    }

    #[instrument(skip(self, ctx, request), fields(doctor_id = %actor.id))]
    pub async fn close_session(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
        request: CloseConsultationRequest,
    ) -> Result<(ConsultationSession, ConsultationSnapshot), ConsultationError> {
        actor.require_role(Role::Doctor)?;
        let session = self.load(session_id).await?;
        Self::require_assigned(actor, &session)?;

        let now = self.clock.now();
        let closed = match self.store.transition(session_id, &Transition::close(now), now).await? {
            Some(session) => session,
            None => return Err(self.explain_miss(session_id, "Only an active consultation can be closed").await),
        };

        let prescriptions = self.store.prescriptions(session_id).await?;
        let tests = self.store.tests(session_id).await?;
        let snapshot = ConsultationSnapshot {
            id: Uuid::new_v4(),
            session_id,
            chief_complaint: closed.chief_complaint.clone(),
            final_diagnosis: request.final_diagnosis.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
            outcome_notes: request.outcome_notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            prescription_ids: prescriptions.iter().map(|p| p.id).collect(),
            test_ids: tests.iter().map(|t| t.id).collect(),
            created_at: now,
        };
        if let Err(e) = self.store.insert_snapshot(&snapshot).await {
            error!(session_id = %session_id, "Consultation closed but snapshot could not be written: {}", e);
            return Err(e);
        }

        self.audit
            .record(
                AuditEvent::new(AuditAction::CloseSession, ENTITY, session_id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status", "ended_at"])
                    .add_metadata("prescription_count", snapshot.prescription_ids.len())
                    .add_metadata("test_count", snapshot.test_ids.len()),
            )
            .await;

        info!(session_id = %session_id, "Consultation completed");
        Ok((closed, snapshot))
    }

    #[instrument(skip(self, ctx), fields(actor_id = %actor.id))]
    pub async fn cancel_consultation(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        let session = self.load(session_id).await?;
        Self::require_owner_or_admin(actor, &session)?;

        if session.status.is_terminal() {
            return Err(ConsultationError::precondition(format!(
                "Consultation is already {}",
                session.status
            )));
        }

        let now = self.clock.now();
        let transition = Transition::cancel(session.status, now);
        let cancelled = match self.store.transition(session_id, &transition, now).await? {
            Some(session) => session,
            None => return Err(self.explain_miss(session_id, "Consultation changed state, try again").await),
        };

        self.cancel_payment_deadline(session_id).await;

        let command = DispatchCommand::SessionCancelled {
            session_id,
            patient_id: cancelled.patient_id,
            doctor_id: session.doctor_id,
        };
        if let Err(e) = self.dispatch.enqueue(command).await {
            warn!(session_id = %session_id, "Failed to enqueue cancellation notice: {}", e);
        }

        self.audit
            .record(
                AuditEvent::new(AuditAction::ConsultationCancelled, ENTITY, session_id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .fields(&["status", "ended_at"])
                    .add_metadata("previous_status", session.status),
            )
            .await;

        info!(session_id = %session_id, "Consultation cancelled from {}", session.status);
        Ok(cancelled)
    }

    /// Scheduler entry point. Safe to run any number of times: it only acts on
    /// a session that is still ACCEPTED with an elapsed deadline.
    #[instrument(skip(self))]
    pub async fn handle_payment_timeout(&self, session_id: Uuid) -> Result<TimeoutOutcome, ConsultationError> {
        let now = self.clock.now();

        if let Some(reverted) = self
            .store
            .transition(session_id, &Transition::expire_payment(now), now)
            .await?
        {
            let command = DispatchCommand::PaymentTimedOut {
                session_id,
                patient_id: reverted.patient_id,
            };
            if let Err(e) = self.dispatch.enqueue(command).await {
                warn!(session_id = %session_id, "Failed to enqueue payment timeout notice: {}", e);
            }

            self.audit
                .record(
                    AuditEvent::new(AuditAction::PaymentTimeoutReverted, ENTITY, session_id, now)
                        .fields(&["status", "doctor_id", "accepted_at", "accepted_by", "payment_due_at"]),
                )
                .await;

            info!(session_id = %session_id, "Payment deadline passed, consultation returned to queue");
            return Ok(TimeoutOutcome::Reverted);
        }

        let Some(session) = self.store.get_session(session_id).await? else {
            warn!(session_id = %session_id, "Payment timeout for unknown consultation");
            return Ok(TimeoutOutcome::NoOp);
        };

        match (session.status, session.payment_due_at) {
            (SessionStatus::Accepted, Some(due)) if due > now => {
                // Left over from an earlier acceptance cycle.
                self.schedule_timeout(session_id, due).await?;
                let remaining_seconds = (due - now).num_seconds();
                debug!(session_id = %session_id, "Payment timeout deferred by {}s", remaining_seconds);
                Ok(TimeoutOutcome::Deferred { remaining_seconds })
            }
            _ => {
                debug!(session_id = %session_id, "Payment timeout is a no-op for {}", session.status);
                Ok(TimeoutOutcome::NoOp)
            }
        }
    }

    /// Re-arms the deadline task of every ACCEPTED session. Run at startup so
    /// that tasks lost with a crashed worker are recreated.
    pub async fn reconcile_payment_deadlines(&self) -> Result<usize, ConsultationError> {
        let accepted = self.store.sessions_with_status(SessionStatus::Accepted).await?;
        let mut armed = 0;
        for session in accepted {
            if let Some(due) = session.payment_due_at {
                self.schedule_timeout(session.id, due).await?;
                armed += 1;
            }
        }
        if armed > 0 {
            info!("Re-armed {} payment deadlines", armed);
        }
        Ok(armed)
    }

    // ==========================================================================
    // QUERIES
    // ==========================================================================

    pub async fn get_consultation(
        &self,
        actor: &Actor,
        session_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        let session = self.load(session_id).await?;

        let visible = session.is_participant(actor)
            || actor.role == Role::Admin
            || (actor.role == Role::Doctor && session.status == SessionStatus::Waitlisted);
        if !visible {
            return Err(ConsultationError::denied("Not a participant of this consultation"));
        }
        Ok(session)
    }

    pub async fn queue(&self, actor: &Actor) -> Result<QueueView, ConsultationError> {
        if actor.role == Role::Patient {
            return Err(ConsultationError::denied("Only doctors can view the queue"));
        }

        let now = self.clock.now();
        let waitlisted = self.store.sessions_with_status(SessionStatus::Waitlisted).await?;
        let queue: Vec<QueueEntry> = waitlisted
            .into_iter()
            .enumerate()
            .map(|(index, session)| QueueEntry {
                session_id: session.id,
                patient_id: session.patient_id,
                chief_complaint: session.chief_complaint,
                created_at: session.created_at,
                queue_position: index + 1,
                wait_minutes: (now - session.created_at).num_minutes(),
            })
            .collect();

        Ok(QueueView {
            total_in_queue: queue.len(),
            queue,
        })
    }

    pub async fn queue_position(
        &self,
        actor: &Actor,
        session_id: Uuid,
    ) -> Result<QueuePosition, ConsultationError> {
        let session = self.load(session_id).await?;
        Self::require_owner_or_admin(actor, &session)?;

        let waitlisted = self.store.sessions_with_status(SessionStatus::Waitlisted).await?;
        let position = waitlisted
            .iter()
            .position(|queued| queued.id == session_id)
            .map(|index| index + 1);

        Ok(QueuePosition {
            session_id,
            status: session.status,
            position,
            total_in_queue: waitlisted.len(),
            payment_due_at: session.payment_due_at,
        })
    }

    pub async fn my_consultations(&self, actor: &Actor) -> Result<Vec<ConsultationSession>, ConsultationError> {
        match actor.role {
            Role::Patient => self.store.sessions_for_patient(actor.id).await,
            Role::Doctor => self.store.sessions_for_doctor(actor.id).await,
            Role::Admin => Err(ConsultationError::denied("Admins have no consultations of their own")),
        }
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    async fn load(&self, session_id: Uuid) -> Result<ConsultationSession, ConsultationError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ConsultationError::NotFound("Consultation".to_string()))
    }

    /// Turns a conditional write that matched nothing into NotFound or
    /// PreconditionFailed.
    async fn explain_miss(&self, session_id: Uuid, reason: &str) -> ConsultationError {
        match self.store.get_session(session_id).await {
            Ok(Some(_)) => ConsultationError::precondition(reason),
            Ok(None) => ConsultationError::NotFound("Consultation".to_string()),
            Err(e) => e,
        }
    }

    fn require_owner_or_admin(actor: &Actor, session: &ConsultationSession) -> Result<(), ConsultationError> {
        match actor.role {
            Role::Admin => Ok(()),
            Role::Patient if session.patient_id == actor.id => Ok(()),
            _ => Err(ConsultationError::denied("Only the patient who booked this consultation can do this")),
        }
    }

    fn require_assigned(actor: &Actor, session: &ConsultationSession) -> Result<(), ConsultationError> {
        if !session.is_assigned_to(actor.id) {
            return Err(ConsultationError::denied("Not the assigned doctor for this consultation"));
        }
        Ok(())
    }

    async fn schedule_timeout(&self, session_id: Uuid, run_at: DateTime<Utc>) -> Result<(), ConsultationError> {
        let task = ScheduledTask {
            id: TaskId::payment_timeout(session_id),
            payload: TaskPayload::PaymentTimeout { session_id },
            run_at,
            attempt: 0,
        };
        self.scheduler.schedule(task).await?;
        Ok(())
    }

    async fn arm_payment_deadline(
        &self,
        session: &ConsultationSession,
        payment_due_at: DateTime<Utc>,
    ) -> Result<(), ConsultationError> {
        self.schedule_timeout(session.id, payment_due_at).await?;

        let doctor_id = session.doctor_id.ok_or_else(|| {
            ConsultationError::IntegrityViolation("Accepted consultation has no doctor".to_string())
        })?;
        self.dispatch
            .enqueue(DispatchCommand::DoctorAccepted {
                session_id: session.id,
                patient_id: session.patient_id,
                doctor_id,
                payment_due_at,
            })
            .await
    }

    /// Compensation for an acceptance whose follow-up steps failed.
    async fn undo_accept(&self, session_id: Uuid) {
        let now = self.clock.now();
        match self.store.transition(session_id, &Transition::release_to_queue(), now).await {
            Ok(Some(_)) => debug!(session_id = %session_id, "Acceptance reverted"),
            Ok(None) => warn!(session_id = %session_id, "Acceptance already moved on, nothing to revert"),
            Err(e) => error!(session_id = %session_id, "Failed to revert acceptance: {}", e),
        }
        self.cancel_payment_deadline(session_id).await;
    }

    async fn cancel_payment_deadline(&self, session_id: Uuid) {
        if let Err(e) = self.scheduler.cancel(&TaskId::payment_timeout(session_id)).await {
            warn!(session_id = %session_id, "Failed to cancel payment timeout: {}", e);
        }
    }

    /// Compensation for a charge that did not go through after PAID was written.
    async fn restore_unpaid(&self, session_id: Uuid, payment_due_at: DateTime<Utc>) {
        let now = self.clock.now();
        match self
            .store
            .transition(session_id, &Transition::restore_unpaid(payment_due_at), now)
            .await
        {
            Ok(Some(_)) => {
                // The deadline task may have fired and no-oped while PAID.
                if let Err(e) = self.schedule_timeout(session_id, payment_due_at).await {
                    error!(session_id = %session_id, "Failed to re-arm payment deadline: {}", e);
                }
            }
            Ok(None) => warn!(session_id = %session_id, "Session left PAID before payment compensation"),
            Err(e) => error!(session_id = %session_id, "Failed to restore unpaid state: {}", e),
        }
    }

    async fn fail_payment(
        &self,
        actor: &Actor,
        ctx: &RequestContext,
        failed: &PaymentRecord,
        payment_due_at: DateTime<Utc>,
        reason: &str,
    ) {
        let now = self.clock.now();
        if let Err(e) = self.store.settle_payment(failed).await {
            warn!(payment_id = %failed.id, "Failed to mark payment as failed: {}", e);
        }
        self.restore_unpaid(failed.session_id, payment_due_at).await;

        self.audit
            .record(
                AuditEvent::new(AuditAction::PaymentFailed, "consultation_payment", failed.id, now)
                    .by(actor.id)
                    .with_context(ctx)
                    .add_metadata("session_id", failed.session_id)
                    .add_metadata("reason", reason),
            )
            .await;
        warn!(session_id = %failed.session_id, "Payment failed: {}", reason);
    }
}

#[async_trait]
impl TaskHandler for LifecycleEngine {
    async fn handle(&self, task: &ScheduledTask) -> Result<(), ConsultationError> {
        match task.payload {
            TaskPayload::PaymentTimeout { session_id } => {
                self.handle_payment_timeout(session_id).await?;
                Ok(())
            }
        }
    }
}
