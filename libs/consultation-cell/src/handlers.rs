use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    Extension,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::{auth::User, error::AppError};

use crate::models::{
    Actor, CloseConsultationRequest, CreateConsultationRequest, NewDiagnosticTest, NewPrescription,
    PaymentReceipt, RequestContext, SendMessageRequest,
};
use crate::services::ConsultationServices;

fn caller(user: &User, headers: &HeaderMap) -> Result<(Actor, RequestContext), AppError> {
    let actor = Actor::from_user(user)?;
    Ok((actor, RequestContext::from_headers(headers)))
}

// ==============================================================================
// LIFECYCLE
// ==============================================================================

/// Patient joins the queue
pub async fn create_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Json(request): Json<CreateConsultationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    info!("Consultation request from patient {}", actor.id);

    let session = services
        .engine
        .create_consultation(&actor, &ctx, &request.chief_complaint)
        .await?;
    let position = services.engine.queue_position(&actor, session.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "consultation": session,
            "queue_position": position.position,
            "total_in_queue": position.total_in_queue
        })),
    ))
}

pub async fn get_queue(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let (actor, _) = caller(&user, &headers)?;
    let view = services.engine.queue(&actor).await?;

    Ok(Json(json!({
        "success": true,
        "queue": view.queue,
        "total_in_queue": view.total_in_queue
    })))
}

pub async fn get_my_consultations(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let (actor, _) = caller(&user, &headers)?;
    let consultations = services.engine.my_consultations(&actor).await?;

    Ok(Json(json!({
        "success": true,
        "consultations": consultations,
        "total": consultations.len()
    })))
}

pub async fn get_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, _) = caller(&user, &headers)?;
    let session = services.engine.get_consultation(&actor, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "consultation": session
    })))
}

pub async fn get_queue_position(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, _) = caller(&user, &headers)?;
    let position = services.engine.queue_position(&actor, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "session_id": position.session_id,
        "status": position.status,
        "position": position.position,
        "total_in_queue": position.total_in_queue,
        "payment_due_at": position.payment_due_at
    })))
}

/// Doctor accepts a waitlisted consultation
pub async fn accept_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    info!("Doctor {} accepting consultation {}", actor.id, session_id);

    let accepted = services.engine.accept(&actor, &ctx, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "consultation": accepted
    })))
}

pub async fn pay_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let receipt = services.engine.pay(&actor, &ctx, session_id).await?;

    let message = match receipt {
        PaymentReceipt::Paid { .. } => "Payment completed",
        PaymentReceipt::AlreadyPaid { .. } => "Payment already completed",
    };

    Ok(Json(json!({
        "success": true,
        "message": message,
        "payment": receipt
    })))
}

pub async fn cancel_payment(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let session = services.engine.cancel_payment(&actor, &ctx, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Consultation returned to queue",
        "consultation": session
    })))
}

pub async fn start_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let session = services.engine.start_session(&actor, &ctx, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "consultation": session
    })))
}

pub async fn close_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CloseConsultationRequest>,
) -> Result<Json<Value>, AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let (session, snapshot) = services
        .engine
        .close_session(&actor, &ctx, session_id, request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "consultation": session,
        "snapshot": snapshot
    })))
}

pub async fn cancel_consultation(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let session = services.engine.cancel_consultation(&actor, &ctx, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "consultation": session
    })))
}

// ==============================================================================
// CLINICAL RECORDS
// ==============================================================================

pub async fn send_message(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let message = services
        .records
        .send_message(&actor, &ctx, session_id, &request.message)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": message
        })),
    ))
}

pub async fn get_records(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (actor, _) = caller(&user, &headers)?;
    let records = services.records.history(&actor, session_id).await?;

    Ok(Json(json!({
        "success": true,
        "records": records
    })))
}

pub async fn issue_prescription(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    Json(request): Json<NewPrescription>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let prescription = services
        .records
        .issue_prescription(&actor, &ctx, session_id, request)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "prescription": prescription
        })),
    ))
}

pub async fn revise_prescription(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(prescription_id): Path<Uuid>,
    Json(request): Json<NewPrescription>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let prescription = services
        .records
        .revise_prescription(&actor, &ctx, prescription_id, request)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "prescription": prescription
        })),
    ))
}

pub async fn order_test(
    State(services): State<Arc<ConsultationServices>>,
    Extension(user): Extension<User>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    Json(request): Json<NewDiagnosticTest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (actor, ctx) = caller(&user, &headers)?;
    let test = services.records.order_test(&actor, &ctx, session_id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "diagnostic_test": test
        })),
    ))
}
