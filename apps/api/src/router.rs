use std::sync::Arc;

use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};

use consultation_cell::{create_consultation_router, ConsultationServices};

pub fn create_router(services: Arc<ConsultationServices>) -> Router {
    Router::new()
        .route("/", get(|| async { "Consultation API is running!" }))
        .route("/health", get(health))
        .nest("/consultations", create_consultation_router(services))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
