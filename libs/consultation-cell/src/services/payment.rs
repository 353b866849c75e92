use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ConsultationError;
use crate::models::{PaymentOutcome, PaymentRequest, PaymentStatus};

/// Charges the consultation fee. A declined charge is an `Ok` outcome with
/// `PaymentStatus::Failed`; `Err` means the provider could not be reached.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentOutcome, ConsultationError>;
}

/// Local provider for development and tests. Refuses to run unless enabled.
pub struct MockPaymentProvider {
    enabled: bool,
    decline: bool,
}

impl MockPaymentProvider {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, decline: false }
    }

    pub fn declining() -> Self {
        Self { enabled: true, decline: true }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentOutcome, ConsultationError> {
        if !self.enabled {
            return Err(ConsultationError::PaymentFailed("Mock payment is disabled".to_string()));
        }

        let suffix: u32 = rand::thread_rng().gen();
        let transaction_id = format!("MOCK_{}_{:08x}", Utc::now().timestamp_millis(), suffix);
        let status = if self.decline {
            PaymentStatus::Failed
        } else {
            PaymentStatus::Completed
        };

        info!(
            "Mock payment {} for session {}: {:?}",
            transaction_id, request.session_id, status
        );

        Ok(PaymentOutcome {
            transaction_id,
            status,
            method: "MOCK_PAYMENT".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
}

/// Card gateway speaking a payment-intents style HTTP API.
pub struct GatewayPaymentProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GatewayPaymentProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl PaymentProvider for GatewayPaymentProvider {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentOutcome, ConsultationError> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        debug!("Creating payment intent for session {}", request.session_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", request.session_id.to_string())
            .json(&json!({
                "amount": request.amount,
                "currency": request.currency.to_lowercase(),
                "confirm": true,
                "metadata": {
                    "session_id": request.session_id,
                    "patient_id": request.patient_id,
                }
            }))
            .send()
            .await
            .map_err(|e| ConsultationError::PaymentFailed(format!("Gateway unreachable: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            warn!("Payment gateway rejected charge ({}): {}", status, body);
            return Err(ConsultationError::PaymentFailed(format!("Gateway rejected charge ({})", status)));
        }
        if !status.is_success() {
            return Err(ConsultationError::PaymentFailed(format!("Gateway error ({})", status)));
        }

        let intent: PaymentIntent = response
            .json()
            .await
            .map_err(|e| ConsultationError::PaymentFailed(format!("Unreadable gateway response: {}", e)))?;

        Ok(PaymentOutcome {
            status: if intent.status == "succeeded" {
                PaymentStatus::Completed
            } else {
                PaymentStatus::Failed
            },
            transaction_id: intent.id,
            method: "CARD".to_string(),
        })
    }
}

/// Selected when neither the mock nor a gateway is configured.
#[derive(Debug, Default)]
pub struct UnconfiguredPaymentProvider;

#[async_trait]
impl PaymentProvider for UnconfiguredPaymentProvider {
    async fn charge(&self, _request: &PaymentRequest) -> Result<PaymentOutcome, ConsultationError> {
        Err(ConsultationError::PaymentFailed("No payment provider configured".to_string()))
    }
}
