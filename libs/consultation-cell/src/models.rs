// libs/consultation-cell/src/models.rs
use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;

use crate::error::ConsultationError;

// ==============================================================================
// ACTORS AND REQUEST CONTEXT
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

impl FromStr for Role {
    type Err = ConsultationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "admin" => Ok(Role::Admin),
            other => Err(ConsultationError::denied(format!("Unknown role '{}'", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Patient => write!(f, "PATIENT"),
            Role::Doctor => write!(f, "DOCTOR"),
            Role::Admin => write!(f, "ADMIN"),
        }
    }
}

/// The authenticated caller of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn patient(id: Uuid) -> Self {
        Self::new(id, Role::Patient)
    }

    pub fn doctor(id: Uuid) -> Self {
        Self::new(id, Role::Doctor)
    }

    pub fn admin(id: Uuid) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn from_user(user: &User) -> Result<Self, ConsultationError> {
        let id = Uuid::parse_str(&user.id).map_err(|_| ConsultationError::AuthenticationRequired)?;
        let role = user
            .role
            .as_deref()
            .ok_or_else(|| ConsultationError::denied("No role assigned"))?
            .parse()?;
        Ok(Self { id, role })
    }

    pub fn require_role(&self, role: Role) -> Result<(), ConsultationError> {
        if self.role != role {
            return Err(ConsultationError::denied(format!("Requires {} role", role)));
        }
        Ok(())
    }
}

/// Caller metadata kept for audit and consent records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let ip_address = header("x-forwarded-for")
            .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header("x-real-ip"));

        Self {
            ip_address,
            user_agent: header("user-agent"),
        }
    }
}

// ==============================================================================
// CONSULTATION SESSION
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Waitlisted,
    Accepted,
    Paid,
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn can_transition_to(&self, target: &SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, target) {
            (Waitlisted, Accepted) => true,
            (Accepted, Waitlisted) => true,
            (Accepted, Paid) => true,
            // Compensation when the charge is declined after the status moved.
            (Paid, Accepted) => true,
            (Paid, Active) => true,
            (Active, Completed) => true,
            (_, Cancelled) => !self.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waitlisted => "WAITLISTED",
            SessionStatus::Accepted => "ACCEPTED",
            SessionStatus::Paid => "PAID",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn open_statuses() -> [SessionStatus; 4] {
        [
            SessionStatus::Waitlisted,
            SessionStatus::Accepted,
            SessionStatus::Paid,
            SessionStatus::Active,
        ]
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consent captured once, when the session goes ACTIVE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsentRecord {
    pub version: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub given_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultationSession {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub chief_complaint: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<Uuid>,
    pub payment_due_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub consent: Option<ConsentRecord>,
}

impl ConsultationSession {
    pub fn new_waitlisted(patient_id: Uuid, chief_complaint: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            doctor_id: None,
            chief_complaint: chief_complaint.to_string(),
            status: SessionStatus::Waitlisted,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            accepted_by: None,
            payment_due_at: None,
            started_at: None,
            ended_at: None,
            consent: None,
        }
    }

    pub fn is_assigned_to(&self, doctor_id: Uuid) -> bool {
        self.doctor_id == Some(doctor_id)
    }

    pub fn is_participant(&self, actor: &Actor) -> bool {
        match actor.role {
            Role::Patient => self.patient_id == actor.id,
            Role::Doctor => self.is_assigned_to(actor.id),
            Role::Admin => false,
        }
    }
}

// ==============================================================================
// CONDITIONAL TRANSITIONS
// ==============================================================================

/// Per-column instruction inside a [`SessionPatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Keep
    }
}

impl<T: Clone> FieldUpdate<T> {
    pub fn apply_to(&self, field: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *field = Some(value.clone()),
            FieldUpdate::Clear => *field = None,
        }
    }
}

impl<T: Serialize> FieldUpdate<T> {
    fn write_column(&self, column: &str, row: &mut Map<String, Value>) -> Result<(), serde_json::Error> {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => {
                row.insert(column.to_string(), serde_json::to_value(value)?);
            }
            FieldUpdate::Clear => {
                row.insert(column.to_string(), Value::Null);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionPatch {
    pub status: SessionStatus,
    pub doctor_id: FieldUpdate<Uuid>,
    pub accepted_by: FieldUpdate<Uuid>,
    pub accepted_at: FieldUpdate<DateTime<Utc>>,
    pub payment_due_at: FieldUpdate<DateTime<Utc>>,
    pub started_at: FieldUpdate<DateTime<Utc>>,
    pub ended_at: FieldUpdate<DateTime<Utc>>,
    pub consent: FieldUpdate<ConsentRecord>,
}

impl SessionPatch {
    pub fn to_status(status: SessionStatus) -> Self {
        Self {
            status,
            doctor_id: FieldUpdate::Keep,
            accepted_by: FieldUpdate::Keep,
            accepted_at: FieldUpdate::Keep,
            payment_due_at: FieldUpdate::Keep,
            started_at: FieldUpdate::Keep,
            ended_at: FieldUpdate::Keep,
            consent: FieldUpdate::Keep,
        }
    }

    /// payment_due_at only lives while the session is ACCEPTED.
    fn effective_payment_due_at(&self) -> FieldUpdate<DateTime<Utc>> {
        if self.status == SessionStatus::Accepted {
            self.payment_due_at.clone()
        } else {
            FieldUpdate::Clear
        }
    }

    pub fn apply(&self, session: &mut ConsultationSession, now: DateTime<Utc>) {
        session.status = self.status;
        self.doctor_id.apply_to(&mut session.doctor_id);
        self.accepted_by.apply_to(&mut session.accepted_by);
        self.accepted_at.apply_to(&mut session.accepted_at);
        self.effective_payment_due_at().apply_to(&mut session.payment_due_at);
        self.started_at.apply_to(&mut session.started_at);
        self.ended_at.apply_to(&mut session.ended_at);
        self.consent.apply_to(&mut session.consent);
        session.updated_at = now;
    }

    /// Column map for a PostgREST PATCH body.
    pub fn to_row(&self, now: DateTime<Utc>) -> Result<Value, serde_json::Error> {
        let mut row = Map::new();
        row.insert("status".to_string(), serde_json::to_value(self.status)?);
        self.doctor_id.write_column("doctor_id", &mut row)?;
        self.accepted_by.write_column("accepted_by", &mut row)?;
        self.accepted_at.write_column("accepted_at", &mut row)?;
        self.effective_payment_due_at().write_column("payment_due_at", &mut row)?;
        self.started_at.write_column("started_at", &mut row)?;
        self.ended_at.write_column("ended_at", &mut row)?;
        self.consent.write_column("consent", &mut row)?;
        row.insert("updated_at".to_string(), serde_json::to_value(now)?);
        Ok(Value::Object(row))
    }
}

/// A compare-and-swap on one session row: the patch is applied only when the
/// persisted status equals `expected` (and, for deadline expiry, the payment
/// deadline has elapsed).
#[derive(Debug, Clone)]
pub struct Transition {
    pub expected: SessionStatus,
    pub due_at_or_before: Option<DateTime<Utc>>,
    pub patch: SessionPatch,
}

impl Transition {
    fn new(expected: SessionStatus, patch: SessionPatch) -> Self {
        Self {
            expected,
            due_at_or_before: None,
            patch,
        }
    }

    pub fn accept(doctor_id: Uuid, now: DateTime<Utc>, payment_due_at: DateTime<Utc>) -> Self {
        let mut patch = SessionPatch::to_status(SessionStatus::Accepted);
        patch.doctor_id = FieldUpdate::Set(doctor_id);
        patch.accepted_by = FieldUpdate::Set(doctor_id);
        patch.accepted_at = FieldUpdate::Set(now);
        patch.payment_due_at = FieldUpdate::Set(payment_due_at);
        Self::new(SessionStatus::Waitlisted, patch)
    }

    pub fn release_to_queue() -> Self {
        let mut patch = SessionPatch::to_status(SessionStatus::Waitlisted);
        patch.doctor_id = FieldUpdate::Clear;
        patch.accepted_by = FieldUpdate::Clear;
        patch.accepted_at = FieldUpdate::Clear;
        patch.payment_due_at = FieldUpdate::Clear;
        Self::new(SessionStatus::Accepted, patch)
    }

    pub fn expire_payment(now: DateTime<Utc>) -> Self {
        let mut transition = Self::release_to_queue();
        transition.due_at_or_before = Some(now);
        transition
    }

    pub fn mark_paid() -> Self {
        Self::new(SessionStatus::Accepted, SessionPatch::to_status(SessionStatus::Paid))
    }

    pub fn restore_unpaid(payment_due_at: DateTime<Utc>) -> Self {
        let mut patch = SessionPatch::to_status(SessionStatus::Accepted);
        patch.payment_due_at = FieldUpdate::Set(payment_due_at);
        Self::new(SessionStatus::Paid, patch)
    }

    pub fn start(now: DateTime<Utc>, consent: ConsentRecord) -> Self {
        let mut patch = SessionPatch::to_status(SessionStatus::Active);
        patch.started_at = FieldUpdate::Set(now);
        patch.consent = FieldUpdate::Set(consent);
        Self::new(SessionStatus::Paid, patch)
    }

    pub fn close(now: DateTime<Utc>) -> Self {
        let mut patch = SessionPatch::to_status(SessionStatus::Completed);
        patch.ended_at = FieldUpdate::Set(now);
        Self::new(SessionStatus::Active, patch)
    }

    pub fn cancel(from: SessionStatus, now: DateTime<Utc>) -> Self {
        let mut patch = SessionPatch::to_status(SessionStatus::Cancelled);
        patch.ended_at = FieldUpdate::Set(now);
        Self::new(from, patch)
    }

    pub fn target(&self) -> SessionStatus {
        self.patch.status
    }

    pub fn is_satisfied_by(&self, session: &ConsultationSession) -> bool {
        if session.status != self.expected {
            return false;
        }
        match self.due_at_or_before {
            None => true,
            Some(limit) => session.payment_due_at.map_or(false, |due| due <= limit),
        }
    }
}

// ==============================================================================
// PAYMENTS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub patient_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn pending(request: &PaymentRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            patient_id: request.patient_id,
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentStatus::Pending,
            transaction_id: None,
            payment_method: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn settle(&self, outcome: &PaymentOutcome, now: DateTime<Utc>) -> Self {
        Self {
            status: outcome.status,
            transaction_id: Some(outcome.transaction_id.clone()),
            payment_method: Some(outcome.method.clone()),
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn decline(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            updated_at: now,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    pub session_id: Uuid,
    pub patient_id: Uuid,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentOutcome {
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentReceipt {
    Paid {
        payment_id: Uuid,
        transaction_id: String,
    },
    AlreadyPaid {
        payment_id: Uuid,
    },
}

// ==============================================================================
// CLINICAL RECORDS (APPEND-ONLY)
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub sender_role: Role,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Medication {
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prescription {
    pub id: Uuid,
    pub session_id: Uuid,
    pub doctor_id: Uuid,
    pub medications: Vec<Medication>,
    pub diagnosis: String,
    pub notes: Option<String>,
    pub version: i32,
    pub previous_version_id: Option<Uuid>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticTestStatus {
    Ordered,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticTest {
    pub id: Uuid,
    pub session_id: Uuid,
    pub ordered_by: Uuid,
    pub test_name: String,
    pub instructions: Option<String>,
    pub status: DiagnosticTestStatus,
    pub ordered_at: DateTime<Utc>,
}

/// Read-only summary written when a session is closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultationSnapshot {
    pub id: Uuid,
    pub session_id: Uuid,
    pub chief_complaint: String,
    pub final_diagnosis: Option<String>,
    pub outcome_notes: Option<String>,
    pub prescription_ids: Vec<Uuid>,
    pub test_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConsultationRequest {
    pub chief_complaint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseConsultationRequest {
    pub final_diagnosis: Option<String>,
    pub outcome_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrescription {
    pub medications: Vec<Medication>,
    pub diagnosis: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDiagnosticTest {
    pub test_name: String,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptedConsultation {
    pub id: Uuid,
    pub status: SessionStatus,
    pub doctor_id: Uuid,
    pub accepted_at: DateTime<Utc>,
    pub payment_due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub session_id: Uuid,
    pub patient_id: Uuid,
    pub chief_complaint: String,
    pub created_at: DateTime<Utc>,
    pub queue_position: usize,
    pub wait_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueView {
    pub queue: Vec<QueueEntry>,
    pub total_in_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuePosition {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub position: Option<usize>,
    pub total_in_queue: usize,
    pub payment_due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultationRecords {
    pub messages: Vec<ChatMessage>,
    pub prescriptions: Vec<Prescription>,
    pub diagnostic_tests: Vec<DiagnosticTest>,
    pub snapshot: Option<ConsultationSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TimeoutOutcome {
    Reverted,
    Deferred { remaining_seconds: i64 },
    NoOp,
}

// ==============================================================================
// DELAYED TASKS
// ==============================================================================

/// Unique per (session, purpose), so scheduling twice collapses into one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn payment_timeout(session_id: Uuid) -> Self {
        Self(format!("payment-timeout:{}", session_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPayload {
    PaymentTimeout { session_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub run_at: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    AlreadyScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

// ==============================================================================
// DISPATCH AND NOTIFICATIONS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    Email,
    Sms,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub channel: NotificationChannel,
    pub template: String,
    pub data: Value,
}

impl NotificationRequest {
    pub fn sms(user_id: Uuid, template: &str, data: Value) -> Self {
        Self {
            user_id,
            channel: NotificationChannel::Sms,
            template: template.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchCommand {
    DoctorAccepted {
        session_id: Uuid,
        patient_id: Uuid,
        doctor_id: Uuid,
        payment_due_at: DateTime<Utc>,
    },
    PaymentTimedOut {
        session_id: Uuid,
        patient_id: Uuid,
    },
    SessionCancelled {
        session_id: Uuid,
        patient_id: Uuid,
        doctor_id: Option<Uuid>,
    },
    Notify {
        request: NotificationRequest,
    },
}

impl DispatchCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchCommand::DoctorAccepted { .. } => "DOCTOR_ACCEPTED",
            DispatchCommand::PaymentTimedOut { .. } => "PAYMENT_TIMED_OUT",
            DispatchCommand::SessionCancelled { .. } => "SESSION_CANCELLED",
            DispatchCommand::Notify { .. } => "NOTIFY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub request: NotificationRequest,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

// ==============================================================================
// AUDIT
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    CreateConsultation,
    ConsultationAccepted,
    PaymentCompleted,
    DuplicatePaymentAttempt,
    PaymentFailed,
    PaymentCancelled,
    PaymentTimeoutReverted,
    StartSession,
    CloseSession,
    ConsultationCancelled,
    SendMessage,
    CreatePrescription,
    RevisePrescription,
    OrderTest,
}

/// Metadata-only audit record. Never carries message bodies, complaints or
/// prescription contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub field_names_changed: Vec<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, entity_type: &str, entity_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            actor_id: None,
            action,
            entity_type: entity_type.to_string(),
            entity_id: Some(entity_id),
            field_names_changed: Vec::new(),
            ip_address: None,
            user_agent: None,
            metadata: Map::new(),
            timestamp,
        }
    }

    pub fn by(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_context(mut self, ctx: &RequestContext) -> Self {
        self.ip_address = ctx.ip_address.clone();
        self.user_agent = ctx.user_agent.clone();
        self
    }

    pub fn fields(mut self, names: &[&str]) -> Self {
        self.field_names_changed = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn add_metadata<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }
}

// ==============================================================================
// RUNTIME CONFIGURATION
// ==============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub max_queue_size: u64,
    pub max_open_sessions_per_patient: u64,
    pub accept_rate_limit: u64,
    pub accept_rate_window: std::time::Duration,
    pub payment_deadline: Duration,
    pub consultation_fee: i64,
    pub currency: String,
    pub consent_version: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for LifecycleConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            max_open_sessions_per_patient: config.max_open_sessions_per_patient,
            accept_rate_limit: config.accept_rate_limit,
            accept_rate_window: std::time::Duration::from_secs(config.accept_rate_window_seconds),
            payment_deadline: Duration::seconds(config.payment_deadline_seconds),
            consultation_fee: config.consultation_fee,
            currency: config.consultation_currency.clone(),
            consent_version: config.consent_version.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub worker_count: u32,
    pub max_attempts: u32,
    pub base_backoff: std::time::Duration,
    pub dequeue_wait: std::time::Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RelayConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_concurrency.max(1),
            max_attempts: config.notification_max_attempts.max(1),
            base_backoff: std::time::Duration::from_millis(config.notification_backoff_ms),
            dequeue_wait: std::time::Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: std::time::Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(config.scheduler_poll_interval_ms),
            batch_size: 50,
            max_attempts: 3,
            retry_backoff: Duration::seconds(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted_session(now: DateTime<Utc>) -> ConsultationSession {
        let mut session = ConsultationSession::new_waitlisted(Uuid::new_v4(), "Fever", now);
        Transition::accept(Uuid::new_v4(), now, now + Duration::minutes(15)).patch.apply(&mut session, now);
        session
    }

    #[test]
    fn test_every_transition_constructor_follows_a_legal_edge() {
        let now = Utc::now();
        let transitions = vec![
            Transition::accept(Uuid::new_v4(), now, now),
            Transition::release_to_queue(),
            Transition::expire_payment(now),
            Transition::mark_paid(),
            Transition::restore_unpaid(now),
            Transition::start(now, ConsentRecord {
                version: "v1.0.0".to_string(),
                ip_address: None,
                user_agent: None,
                given_at: now,
            }),
            Transition::close(now),
            Transition::cancel(SessionStatus::Paid, now),
        ];

        for transition in transitions {
            assert!(
                transition.expected.can_transition_to(&transition.target()),
                "{:?} -> {:?} is not a legal edge",
                transition.expected,
                transition.target()
            );
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for target in [
            SessionStatus::Waitlisted,
            SessionStatus::Accepted,
            SessionStatus::Paid,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
        ] {
            assert!(!SessionStatus::Completed.can_transition_to(&target));
            assert!(!SessionStatus::Cancelled.can_transition_to(&target));
        }
        assert!(!SessionStatus::Waitlisted.can_transition_to(&SessionStatus::Paid));
    }

    #[test]
    fn test_leaving_accepted_always_clears_payment_deadline() {
        let now = Utc::now();
        let mut session = accepted_session(now);
        assert!(session.payment_due_at.is_some());

        Transition::mark_paid().patch.apply(&mut session, now);
        assert_eq!(session.status, SessionStatus::Paid);
        assert_eq!(session.payment_due_at, None);
        assert!(session.doctor_id.is_some());
    }

    #[test]
    fn test_release_to_queue_clears_assignment() {
        let now = Utc::now();
        let mut session = accepted_session(now);

        Transition::release_to_queue().patch.apply(&mut session, now);
        assert_eq!(session.status, SessionStatus::Waitlisted);
        assert_eq!(session.doctor_id, None);
        assert_eq!(session.accepted_by, None);
        assert_eq!(session.accepted_at, None);
        assert_eq!(session.payment_due_at, None);
    }

    #[test]
    fn test_expiry_guard_requires_elapsed_deadline() {
        let now = Utc::now();
        let session = accepted_session(now);

        assert!(!Transition::expire_payment(now).is_satisfied_by(&session));
        assert!(Transition::expire_payment(now + Duration::minutes(15)).is_satisfied_by(&session));
        assert!(!Transition::mark_paid().is_satisfied_by(&ConsultationSession::new_waitlisted(
            Uuid::new_v4(),
            "Cough",
            now
        )));
    }

    #[test]
    fn test_patch_row_writes_explicit_nulls() {
        let now = Utc::now();
        let row = Transition::release_to_queue().patch.to_row(now).unwrap();

        assert_eq!(row["status"], "WAITLISTED");
        assert!(row["doctor_id"].is_null());
        assert!(row["payment_due_at"].is_null());
        assert!(row.get("started_at").is_none());
    }

    #[test]
    fn test_role_parsing_and_actor_from_user() {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: None,
            role: Some("Doctor".to_string()),
            metadata: None,
            created_at: None,
        };
        let actor = Actor::from_user(&user).unwrap();
        assert_eq!(actor.role, Role::Doctor);
        assert!(actor.require_role(Role::Patient).is_err());

        let anonymous = User { id: "not-a-uuid".to_string(), ..user };
        assert!(matches!(
            Actor::from_user(&anonymous),
            Err(ConsultationError::AuthenticationRequired)
        ));
    }

    #[test]
    fn test_request_context_prefers_first_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());

        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8.0"));
    }
}
