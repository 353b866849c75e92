use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use consultation_cell::{
    ConsultationError, ConsultationSession, ConsultationSnapshot, PaymentRecord, PaymentRequest,
    SessionStatus, SupabaseTransitionStore, Transition, TransitionStore,
};
use shared_database::supabase::SupabaseClient;
use shared_utils::test_utils::TestConfig;

fn store_for(server: &MockServer) -> SupabaseTransitionStore {
    let config = TestConfig::with_supabase_url(&server.uri()).to_app_config();
    SupabaseTransitionStore::new(Arc::new(SupabaseClient::new(&config)))
}

fn accepted_row(session: &ConsultationSession, doctor_id: Uuid) -> serde_json::Value {
    let mut accepted = session.clone();
    accepted.status = SessionStatus::Accepted;
    accepted.doctor_id = Some(doctor_id);
    accepted.accepted_by = Some(doctor_id);
    accepted.accepted_at = Some(session.created_at);
    accepted.payment_due_at = Some(session.created_at + Duration::minutes(15));
    serde_json::to_value(accepted).unwrap()
}

#[tokio::test]
async fn test_accept_is_a_conditional_patch() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    let session = ConsultationSession::new_waitlisted(Uuid::new_v4(), "Fever", now);
    let doctor_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/consultation_sessions"))
        .and(query_param("id", format!("eq.{}", session.id)))
        .and(query_param("status", "eq.WAITLISTED"))
        .and(header("Prefer", "return=representation"))
        .and(header("apikey", "test-anon-key"))
        .and(body_partial_json(json!({
            "status": "ACCEPTED",
            "doctor_id": doctor_id,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([accepted_row(&session, doctor_id)])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    let transition = Transition::accept(doctor_id, now, now + Duration::minutes(15));
    let updated = store
        .transition(session.id, &transition, now)
        .await
        .unwrap()
        .expect("row returned");

    assert_eq!(updated.status, SessionStatus::Accepted);
    assert_eq!(updated.doctor_id, Some(doctor_id));
}

#[tokio::test]
async fn test_empty_representation_is_a_miss() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/consultation_sessions"))
        .and(query_param("status", "eq.WAITLISTED"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    let transition = Transition::accept(Uuid::new_v4(), now, now + Duration::minutes(15));

    assert!(store.transition(Uuid::new_v4(), &transition, now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expiry_filters_on_deadline_and_clears_assignment() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    let cutoff = format!("lte.{}", now.to_rfc3339_opts(SecondsFormat::Millis, true));

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/consultation_sessions"))
        .and(query_param("status", "eq.ACCEPTED"))
        .and(query_param("payment_due_at", cutoff.as_str()))
        .and(body_partial_json(json!({
            "status": "WAITLISTED",
            "doctor_id": null,
            "payment_due_at": null,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    let missed = store
        .transition(Uuid::new_v4(), &Transition::expire_payment(now), now)
        .await
        .unwrap();
    assert!(missed.is_none());
}

#[tokio::test]
async fn test_queue_count_uses_status_filter() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/consultation_sessions"))
        .and(query_param("status", "eq.WAITLISTED"))
        .and(query_param("select", "id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": Uuid::new_v4() },
            { "id": Uuid::new_v4() },
        ])))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    assert_eq!(store.count_with_status(SessionStatus::Waitlisted).await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_snapshot_is_integrity_violation() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/consultation_snapshots"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint"
        })))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    let snapshot = ConsultationSnapshot {
        id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        chief_complaint: "Fever".to_string(),
        final_diagnosis: None,
        outcome_notes: None,
        prescription_ids: vec![],
        test_ids: vec![],
        created_at: Utc::now(),
    };

    assert_matches!(
        store.insert_snapshot(&snapshot).await,
        Err(ConsultationError::IntegrityViolation(_))
    );
}

#[tokio::test]
async fn test_server_errors_are_storage_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/consultation_sessions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    assert_matches!(
        store.get_session(Uuid::new_v4()).await,
        Err(ConsultationError::StorageError(_))
    );
}

#[tokio::test]
async fn test_write_errors_are_classified_by_status() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    let request = PaymentRequest {
        session_id: Uuid::new_v4(),
        patient_id: Uuid::new_v4(),
        amount: 5000,
        currency: "USD".to_string(),
    };
    let conflicting = PaymentRecord::pending(&request, now);
    let rejected = PaymentRecord::pending(&request, now);

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/consultation_payments"))
        .and(query_param("id", format!("eq.{}", conflicting.id)))
        .respond_with(ResponseTemplate::new(409).set_body_string("duplicate transaction_id"))
        .mount(&mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/consultation_payments"))
        .and(query_param("id", format!("eq.{}", rejected.id)))
        .respond_with(ResponseTemplate::new(400).set_body_string("Conflict: column does not exist"))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server);
    assert_matches!(
        store.settle_payment(&conflicting).await,
        Err(ConsultationError::IntegrityViolation(body)) if body == "duplicate transaction_id"
    );
    assert_matches!(
        store.settle_payment(&rejected).await,
        Err(ConsultationError::StorageError(message)) if message.contains("400")
    );
}
