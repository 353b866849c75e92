use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use consultation_cell::{
    Actor, BufferedAuditSink, ClinicalRecordService, Clock, CloseConsultationRequest,
    ConsultationError, ConsultationSession, CounterService, DeadLetter, DispatchCommand, DispatchQueue,
    InMemoryCounterService, InMemoryDispatchQueue, InMemoryTaskScheduler, InMemoryTransitionStore,
    LifecycleComponents, LifecycleConfig, LifecycleEngine, ManualClock, Medication,
    MockPaymentProvider, NewDiagnosticTest, NewPrescription, PaymentProvider, PaymentReceipt,
    RequestContext, SchedulerConfig, SchedulerWorker, SessionStatus, TaskId, TaskScheduler,
    TimeoutOutcome, TransitionStore,
};

struct Harness {
    engine: Arc<LifecycleEngine>,
    records: ClinicalRecordService,
    store: Arc<InMemoryTransitionStore>,
    counters: Arc<InMemoryCounterService>,
    scheduler: Arc<InMemoryTaskScheduler>,
    dispatch: Arc<InMemoryDispatchQueue>,
    audit: Arc<BufferedAuditSink>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: LifecycleConfig, payments: Arc<dyn PaymentProvider>) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryTransitionStore::new());
    let counters = Arc::new(InMemoryCounterService::new(clock.clone()));
    let scheduler = Arc::new(InMemoryTaskScheduler::new());
    let dispatch = Arc::new(InMemoryDispatchQueue::new());
    let audit = Arc::new(BufferedAuditSink::default());

    let components = LifecycleComponents {
        store: store.clone(),
        counters: counters.clone(),
        scheduler: scheduler.clone(),
        dispatch: dispatch.clone(),
        audit: audit.clone(),
        payments,
        clock: clock.clone(),
    };
    let engine = Arc::new(LifecycleEngine::new(components, config));
    let records = ClinicalRecordService::new(store.clone(), audit.clone(), clock.clone());

    Harness {
        engine,
        records,
        store,
        counters,
        scheduler,
        dispatch,
        audit,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(LifecycleConfig::default(), Arc::new(MockPaymentProvider::new(true)))
}

fn ctx() -> RequestContext {
    RequestContext {
        ip_address: Some("203.0.113.10".to_string()),
        user_agent: Some("integration-test".to_string()),
    }
}

async fn waitlisted(h: &Harness) -> (Actor, ConsultationSession) {
    let patient = Actor::patient(Uuid::new_v4());
    let session = h
        .engine
        .create_consultation(&patient, &ctx(), "Persistent cough for two weeks")
        .await
        .unwrap();
    (patient, session)
}

async fn status_of(h: &Harness, session_id: Uuid) -> SessionStatus {
    h.store.get_session(session_id).await.unwrap().unwrap().status
}

async fn queued_commands(h: &Harness) -> Vec<DispatchCommand> {
    let mut commands = Vec::new();
    while let Some(command) = h.dispatch.dequeue(std::time::Duration::ZERO).await.unwrap() {
        commands.push(command);
    }
    commands
}

fn prescription() -> NewPrescription {
    NewPrescription {
        medications: vec![Medication {
            name: "Amoxicillin".to_string(),
            dosage: "500mg".to_string(),
            frequency: "Three times daily".to_string(),
            duration: "7 days".to_string(),
        }],
        diagnosis: "Bacterial bronchitis".to_string(),
        notes: None,
    }
}

// ==============================================================================
// ACCEPT
// ==============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_have_exactly_one_winner() {
    let h = harness();
    let (_, session) = waitlisted(&h).await;
    let session_id = session.id;
    let doctors: Vec<Actor> = (0..10).map(|_| Actor::doctor(Uuid::new_v4())).collect();

    let attempts = doctors.iter().map(|doctor| {
        let engine = h.engine.clone();
        let doctor = *doctor;
        tokio::spawn(async move { engine.accept(&doctor, &ctx(), session_id).await })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert_matches!(e, ConsultationError::PreconditionFailed(_));
        }
    }

    let stored = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Accepted);
    assert_eq!(stored.doctor_id, Some(winners[0].doctor_id));

    // Losers get their rate limit slot back.
    for doctor in &doctors {
        let used = h
            .counters
            .current(&format!("doctor:accept:{}", doctor.id))
            .await
            .unwrap();
        let expected = if doctor.id == winners[0].doctor_id { 1 } else { 0 };
        assert_eq!(used, expected);
    }
}

#[tokio::test]
async fn test_accept_sets_deadline_schedules_timeout_and_notifies() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());

    let accepted = h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
    assert_eq!(accepted.status, SessionStatus::Accepted);
    assert_eq!(accepted.payment_due_at, h.clock.now() + Duration::minutes(15));

    let task = h
        .scheduler
        .get(&TaskId::payment_timeout(session.id))
        .await
        .unwrap()
        .expect("payment timeout scheduled");
    assert_eq!(task.run_at, accepted.payment_due_at);

    let commands = queued_commands(&h).await;
    assert_matches!(
        commands.as_slice(),
        [DispatchCommand::DoctorAccepted { patient_id, .. }] if *patient_id == patient.id
    );
}

#[tokio::test]
async fn test_accept_unknown_session_is_not_found() {
    let h = harness();
    let doctor = Actor::doctor(Uuid::new_v4());

    assert_matches!(
        h.engine.accept(&doctor, &ctx(), Uuid::new_v4()).await,
        Err(ConsultationError::NotFound(_))
    );
}

#[tokio::test]
async fn test_only_doctors_accept() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;

    assert_matches!(
        h.engine.accept(&patient, &ctx(), session.id).await,
        Err(ConsultationError::AuthorizationDenied(_))
    );
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Waitlisted);
}

#[tokio::test]
async fn test_sixth_accept_in_window_is_rate_limited() {
    let h = harness();
    let doctor = Actor::doctor(Uuid::new_v4());

    for _ in 0..5 {
        let (_, session) = waitlisted(&h).await;
        h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
    }

    let (_, sixth) = waitlisted(&h).await;
    assert_matches!(
        h.engine.accept(&doctor, &ctx(), sixth.id).await,
        Err(ConsultationError::RateLimited { limit: 5, window_seconds: 60 })
    );
    assert_eq!(status_of(&h, sixth.id).await, SessionStatus::Waitlisted);

    // Another doctor is unaffected.
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), sixth.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lost_races_do_not_consume_quota() {
    let h = harness();
    let doctor = Actor::doctor(Uuid::new_v4());

    for _ in 0..6 {
        let (_, session) = waitlisted(&h).await;
        let rival = Actor::doctor(Uuid::new_v4());
        h.engine.accept(&rival, &ctx(), session.id).await.unwrap();
        assert_matches!(
            h.engine.accept(&doctor, &ctx(), session.id).await,
            Err(ConsultationError::PreconditionFailed(_))
        );
    }

    let (_, session) = waitlisted(&h).await;
    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
}

/// Dispatch queue whose backend refuses writes.
struct OfflineDispatchQueue;

#[async_trait]
impl DispatchQueue for OfflineDispatchQueue {
    async fn enqueue(&self, _command: DispatchCommand) -> Result<(), ConsultationError> {
        Err(ConsultationError::StorageError("dispatch queue offline".to_string()))
    }

    async fn dequeue(&self, _wait: std::time::Duration) -> Result<Option<DispatchCommand>, ConsultationError> {
        Ok(None)
    }

    async fn len(&self) -> Result<u64, ConsultationError> {
        Ok(0)
    }

    async fn dead_letter(&self, _letter: DeadLetter) -> Result<(), ConsultationError> {
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ConsultationError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_failed_follow_up_reverts_acceptance_and_returns_slot() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryTransitionStore::new());
    let counters = Arc::new(InMemoryCounterService::new(clock.clone()));
    let scheduler = Arc::new(InMemoryTaskScheduler::new());
    let engine = LifecycleEngine::new(
        LifecycleComponents {
            store: store.clone(),
            counters: counters.clone(),
            scheduler: scheduler.clone(),
            dispatch: Arc::new(OfflineDispatchQueue),
            audit: Arc::new(BufferedAuditSink::default()),
            payments: Arc::new(MockPaymentProvider::new(true)),
            clock: clock.clone(),
        },
        LifecycleConfig::default(),
    );

    let patient = Actor::patient(Uuid::new_v4());
    let session = engine
        .create_consultation(&patient, &ctx(), "Chest tightness after exercise")
        .await
        .unwrap();
    let doctor = Actor::doctor(Uuid::new_v4());

    assert_matches!(
        engine.accept(&doctor, &ctx(), session.id).await,
        Err(ConsultationError::StorageError(message)) if message == "dispatch queue offline"
    );

    let stored = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Waitlisted);
    assert_eq!(stored.doctor_id, None);
    assert_eq!(stored.accepted_by, None);
    assert_eq!(stored.accepted_at, None);
    assert_eq!(stored.payment_due_at, None);
    assert_eq!(
        counters.current(&format!("doctor:accept:{}", doctor.id)).await.unwrap(),
        0
    );
    assert!(scheduler
        .get(&TaskId::payment_timeout(session.id))
        .await
        .unwrap()
        .is_none());
}

// ==============================================================================
// CREATE
// ==============================================================================

#[tokio::test]
async fn test_queue_full_rejects_create() {
    let config = LifecycleConfig {
        max_queue_size: 2,
        ..LifecycleConfig::default()
    };
    let h = harness_with(config, Arc::new(MockPaymentProvider::new(true)));

    waitlisted(&h).await;
    waitlisted(&h).await;

    let patient = Actor::patient(Uuid::new_v4());
    assert_matches!(
        h.engine.create_consultation(&patient, &ctx(), "Migraine").await,
        Err(ConsultationError::CapacityExceeded { current: 2, max: 2, .. })
    );
}

#[tokio::test]
async fn test_accepting_frees_queue_capacity() {
    let config = LifecycleConfig {
        max_queue_size: 1,
        ..LifecycleConfig::default()
    };
    let h = harness_with(config, Arc::new(MockPaymentProvider::new(true)));
    let (_, session) = waitlisted(&h).await;

    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();
    waitlisted(&h).await;
}

#[tokio::test]
async fn test_patient_open_session_cap() {
    let config = LifecycleConfig {
        max_open_sessions_per_patient: 1,
        ..LifecycleConfig::default()
    };
    let h = harness_with(config, Arc::new(MockPaymentProvider::new(true)));
    let (patient, session) = waitlisted(&h).await;

    assert_matches!(
        h.engine.create_consultation(&patient, &ctx(), "Second issue").await,
        Err(ConsultationError::CapacityExceeded { .. })
    );

    h.engine.cancel_consultation(&patient, &ctx(), session.id).await.unwrap();
    h.engine
        .create_consultation(&patient, &ctx(), "Second issue")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_blank_complaint_is_rejected() {
    let h = harness();
    let patient = Actor::patient(Uuid::new_v4());

    assert_matches!(
        h.engine.create_consultation(&patient, &ctx(), "   ").await,
        Err(ConsultationError::ValidationError(_))
    );
}

// ==============================================================================
// PAYMENT AND TIMEOUT
// ==============================================================================

#[tokio::test]
async fn test_cancel_payment_restores_a_never_accepted_session() {
    let h = harness();
    let (patient, original) = waitlisted(&h).await;

    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), original.id)
        .await
        .unwrap();
    let reverted = h.engine.cancel_payment(&patient, &ctx(), original.id).await.unwrap();

    assert_eq!(
        ConsultationSession {
            updated_at: original.updated_at,
            ..reverted.clone()
        },
        original
    );
    assert!(h
        .scheduler
        .get(&TaskId::payment_timeout(original.id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_pay_is_idempotent() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    let first = h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    let payment_id = match first {
        PaymentReceipt::Paid { payment_id, .. } => payment_id,
        other => panic!("expected Paid, got {:?}", other),
    };

    let second = h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    assert_eq!(second, PaymentReceipt::AlreadyPaid { payment_id });
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Paid);
}

#[tokio::test]
async fn test_only_the_owning_patient_pays() {
    let h = harness();
    let (_, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    assert_matches!(
        h.engine.pay(&Actor::patient(Uuid::new_v4()), &ctx(), session.id).await,
        Err(ConsultationError::AuthorizationDenied(_))
    );
}

#[tokio::test]
async fn test_declined_payment_returns_session_to_accepted() {
    let h = harness_with(LifecycleConfig::default(), Arc::new(MockPaymentProvider::declining()));
    let (patient, session) = waitlisted(&h).await;
    let accepted = h
        .engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    assert_matches!(
        h.engine.pay(&patient, &ctx(), session.id).await,
        Err(ConsultationError::PaymentFailed(_))
    );

    let stored = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Accepted);
    assert_eq!(stored.payment_due_at, Some(accepted.payment_due_at));
    assert!(h.store.completed_payment(session.id).await.unwrap().is_none());
    assert!(h
        .scheduler
        .get(&TaskId::payment_timeout(session.id))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_pay_after_deadline_is_rejected() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(16));
    assert_matches!(
        h.engine.pay(&patient, &ctx(), session.id).await,
        Err(ConsultationError::PreconditionFailed(_))
    );
}

#[tokio::test]
async fn test_transient_settle_failure_is_retried() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    h.store.fail_next_settlements(1);
    assert_matches!(
        h.engine.pay(&patient, &ctx(), session.id).await,
        Ok(PaymentReceipt::Paid { .. })
    );
    assert!(h.store.completed_payment(session.id).await.unwrap().is_some());
    assert!(h.store.pending_payment(session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unsettled_charge_is_completed_by_next_pay() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());
    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();

    h.store.fail_next_settlements(3);
    assert_matches!(
        h.engine.pay(&patient, &ctx(), session.id).await,
        Err(ConsultationError::StorageError(_))
    );
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Paid);
    let stranded = h
        .store
        .pending_payment(session.id)
        .await
        .unwrap()
        .expect("charge left pending");
    assert_matches!(
        h.engine.start_session(&doctor, &ctx(), session.id).await,
        Err(ConsultationError::PreconditionFailed(_))
    );

    let receipt = h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    assert_matches!(receipt, PaymentReceipt::Paid { payment_id, .. } if payment_id == stranded.id);
    assert!(h.store.pending_payment(session.id).await.unwrap().is_none());

    h.engine.start_session(&doctor, &ctx(), session.id).await.unwrap();
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Active);
}

#[tokio::test]
async fn test_timeout_reverts_at_most_once() {
    let h = harness();
    let (_, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();
    queued_commands(&h).await;

    h.clock.advance(Duration::minutes(15));
    assert_eq!(
        h.engine.handle_payment_timeout(session.id).await.unwrap(),
        TimeoutOutcome::Reverted
    );
    assert_eq!(
        h.engine.handle_payment_timeout(session.id).await.unwrap(),
        TimeoutOutcome::NoOp
    );

    let stored = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Waitlisted);
    assert_eq!(stored.doctor_id, None);
    assert_eq!(stored.payment_due_at, None);

    let commands = queued_commands(&h).await;
    assert_matches!(commands.as_slice(), [DispatchCommand::PaymentTimedOut { .. }]);
}

#[tokio::test]
async fn test_stale_timeout_defers_to_current_deadline() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());

    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
    h.engine.cancel_payment(&patient, &ctx(), session.id).await.unwrap();

    h.clock.advance(Duration::minutes(10));
    let second = h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();

    // The first cycle's timer fires late.
    h.clock.advance(Duration::minutes(5));
    h.scheduler.cancel(&TaskId::payment_timeout(session.id)).await.unwrap();
    assert_eq!(
        h.engine.handle_payment_timeout(session.id).await.unwrap(),
        TimeoutOutcome::Deferred { remaining_seconds: 600 }
    );
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Accepted);

    let rescheduled = h
        .scheduler
        .get(&TaskId::payment_timeout(session.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rescheduled.run_at, second.payment_due_at);
}

#[tokio::test]
async fn test_scheduler_worker_expires_unpaid_session() {
    let h = harness();
    let (_, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    let worker = SchedulerWorker::new(
        h.scheduler.clone(),
        h.engine.clone(),
        h.clock.clone(),
        SchedulerConfig::default(),
    );

    assert_eq!(worker.tick().await.unwrap(), 0);
    h.clock.advance(Duration::minutes(15) + Duration::seconds(1));
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Waitlisted);
}

#[tokio::test]
async fn test_reconcile_rearms_lost_deadlines() {
    let h = harness();
    let (_, session) = waitlisted(&h).await;
    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
        .await
        .unwrap();

    let id = TaskId::payment_timeout(session.id);
    h.scheduler.cancel(&id).await.unwrap();

    assert_eq!(h.engine.reconcile_payment_deadlines().await.unwrap(), 1);
    assert!(h.scheduler.get(&id).await.unwrap().is_some());
}

// ==============================================================================
// SESSION
// ==============================================================================

#[tokio::test]
async fn test_round_trip_leaves_completed_session_with_snapshot() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());

    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
    h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    let active = h.engine.start_session(&doctor, &ctx(), session.id).await.unwrap();
    assert_eq!(active.status, SessionStatus::Active);
    let consent = active.consent.expect("consent recorded at start");
    assert_eq!(consent.version, "v1.0.0");
    assert_eq!(consent.ip_address.as_deref(), Some("203.0.113.10"));

    h.records
        .send_message(&patient, &ctx(), session.id, "Cough is worse at night")
        .await
        .unwrap();
    let first = h
        .records
        .issue_prescription(&doctor, &ctx(), session.id, prescription())
        .await
        .unwrap();
    let revised = h
        .records
        .revise_prescription(&doctor, &ctx(), first.id, prescription())
        .await
        .unwrap();
    let test = h
        .records
        .order_test(
            &doctor,
            &ctx(),
            session.id,
            NewDiagnosticTest {
                test_name: "Chest X-ray".to_string(),
                instructions: None,
            },
        )
        .await
        .unwrap();

    let (closed, snapshot) = h
        .engine
        .close_session(
            &doctor,
            &ctx(),
            session.id,
            CloseConsultationRequest {
                final_diagnosis: Some("Bronchitis".to_string()),
                outcome_notes: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.ended_at.is_some());
    assert_eq!(snapshot.prescription_ids, vec![first.id, revised.id]);
    assert_eq!(snapshot.test_ids, vec![test.id]);
    assert_eq!(h.store.snapshot(session.id).await.unwrap(), Some(snapshot));

    // Completed sessions accept no further records.
    assert_matches!(
        h.records
            .issue_prescription(&doctor, &ctx(), session.id, prescription())
            .await,
        Err(ConsultationError::PreconditionFailed(_))
    );
}

#[tokio::test]
async fn test_start_requires_assigned_doctor_and_payment() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());
    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();

    assert_matches!(
        h.engine.start_session(&doctor, &ctx(), session.id).await,
        Err(ConsultationError::PreconditionFailed(_))
    );

    h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    assert_matches!(
        h.engine
            .start_session(&Actor::doctor(Uuid::new_v4()), &ctx(), session.id)
            .await,
        Err(ConsultationError::AuthorizationDenied(_))
    );

    h.engine.start_session(&doctor, &ctx(), session.id).await.unwrap();
    assert_matches!(
        h.engine.start_session(&doctor, &ctx(), session.id).await,
        Err(ConsultationError::PreconditionFailed(_))
    );
}

#[tokio::test]
async fn test_cancel_from_paid_is_terminal() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());
    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
    h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    queued_commands(&h).await;

    let cancelled = h
        .engine
        .cancel_consultation(&patient, &ctx(), session.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    assert_matches!(
        h.engine.cancel_consultation(&patient, &ctx(), session.id).await,
        Err(ConsultationError::PreconditionFailed(_))
    );
    assert_matches!(
        h.engine.start_session(&doctor, &ctx(), session.id).await,
        Err(ConsultationError::PreconditionFailed(_))
    );

    let commands = queued_commands(&h).await;
    assert_matches!(
        commands.as_slice(),
        [DispatchCommand::SessionCancelled { doctor_id: Some(d), .. }] if *d == doctor.id
    );
}

// ==============================================================================
// QUERIES AND AUDIT
// ==============================================================================

#[tokio::test]
async fn test_queue_is_fifo_with_computed_positions() {
    let h = harness();
    let (_, first) = waitlisted(&h).await;
    h.clock.advance(Duration::minutes(3));
    let (second_patient, second) = waitlisted(&h).await;
    h.clock.advance(Duration::minutes(2));

    let view = h.engine.queue(&Actor::doctor(Uuid::new_v4())).await.unwrap();
    assert_eq!(view.total_in_queue, 2);
    assert_eq!(view.queue[0].session_id, first.id);
    assert_eq!(view.queue[0].wait_minutes, 5);
    assert_eq!(view.queue[1].queue_position, 2);

    let position = h.engine.queue_position(&second_patient, second.id).await.unwrap();
    assert_eq!(position.position, Some(2));

    h.engine
        .accept(&Actor::doctor(Uuid::new_v4()), &ctx(), first.id)
        .await
        .unwrap();
    let position = h.engine.queue_position(&second_patient, second.id).await.unwrap();
    assert_eq!(position.position, Some(1));

    assert_matches!(
        h.engine.queue(&second_patient).await,
        Err(ConsultationError::AuthorizationDenied(_))
    );
}

#[tokio::test]
async fn test_audit_trail_carries_no_clinical_content() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let doctor = Actor::doctor(Uuid::new_v4());
    h.engine.accept(&doctor, &ctx(), session.id).await.unwrap();
    h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    h.engine.start_session(&doctor, &ctx(), session.id).await.unwrap();
    h.records
        .send_message(&doctor, &ctx(), session.id, "Take the first dose tonight")
        .await
        .unwrap();

    let entries = h.audit.entries().await;
    assert!(entries.len() >= 5);

    let serialized = serde_json::to_string(&entries).unwrap();
    assert!(!serialized.contains("Persistent cough"));
    assert!(!serialized.contains("first dose"));
}

#[tokio::test]
async fn test_full_race_and_payment_scenario() {
    let h = harness();
    let (patient, session) = waitlisted(&h).await;
    let position = h.engine.queue_position(&patient, session.id).await.unwrap();
    assert_eq!(position.position, Some(1));

    let doctor_a = Actor::doctor(Uuid::new_v4());
    let doctor_b = Actor::doctor(Uuid::new_v4());
    let (ctx_a, ctx_b) = (ctx(), ctx());
    let (a, b) = tokio::join!(
        h.engine.accept(&doctor_a, &ctx_a, session.id),
        h.engine.accept(&doctor_b, &ctx_b, session.id)
    );
    let (winner, loser) = if a.is_ok() { (a, b) } else { (b, a) };
    let accepted = winner.unwrap();
    assert_eq!(accepted.payment_due_at, accepted.accepted_at + Duration::minutes(15));
    assert_matches!(loser, Err(ConsultationError::PreconditionFailed(_)));

    h.clock.advance(Duration::minutes(5));
    h.engine.pay(&patient, &ctx(), session.id).await.unwrap();
    assert!(h
        .scheduler
        .get(&TaskId::payment_timeout(session.id))
        .await
        .unwrap()
        .is_none());

    h.clock.advance(Duration::minutes(20));
    assert_eq!(
        h.engine.handle_payment_timeout(session.id).await.unwrap(),
        TimeoutOutcome::NoOp
    );
    assert_eq!(status_of(&h, session.id).await, SessionStatus::Paid);
}
