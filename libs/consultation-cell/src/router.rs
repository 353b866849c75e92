use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::{
    accept_consultation, cancel_consultation, cancel_payment, close_consultation,
    create_consultation, get_consultation, get_my_consultations, get_queue, get_queue_position,
    get_records, issue_prescription, order_test, pay_consultation, revise_prescription,
    send_message, start_consultation,
};
use crate::services::ConsultationServices;

pub fn create_consultation_router(services: Arc<ConsultationServices>) -> Router {
    let protected_routes = Router::new()
        .route("/", post(create_consultation))
        .route("/queue", get(get_queue))
        .route("/mine", get(get_my_consultations))
        .route("/{session_id}", get(get_consultation))
        .route("/{session_id}/queue-position", get(get_queue_position))
        .route("/{session_id}/accept", post(accept_consultation))
        .route("/{session_id}/pay", post(pay_consultation))
        .route("/{session_id}/cancel-payment", post(cancel_payment))
        .route("/{session_id}/start", post(start_consultation))
        .route("/{session_id}/close", post(close_consultation))
        .route("/{session_id}/cancel", post(cancel_consultation))
        .route("/{session_id}/messages", post(send_message))
        .route("/{session_id}/records", get(get_records))
        .route("/{session_id}/prescriptions", post(issue_prescription))
        .route("/{session_id}/tests", post(order_test))
        .route("/prescriptions/{prescription_id}/revise", post(revise_prescription))
        .layer(middleware::from_fn_with_state(services.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(services)
}
