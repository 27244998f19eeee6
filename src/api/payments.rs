//! Payment endpoints

use super::{ApiError, ApiJson, ApiState, AuthedClient};
use crate::db::PaymentModel;
use crate::engine::{CreateOutcome, CreateRequest};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Payment create request body
#[derive(Debug, Deserialize)]
pub struct PaymentCreateBody {
    /// Payment method, currently only "BTC_LN"
    pub payment_method: String,
    /// Fiat amount
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Merchant order reference
    pub external_code: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Optional terminal-state callback URL
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Optional checkout redirect URL
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Opaque merchant metadata
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Optional idempotency key
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Invoice section of the payment response
#[derive(Debug, Serialize)]
pub struct InvoiceBody {
    /// Provider name
    pub provider: String,
    /// Provider-side invoice identifier
    pub provider_invoice_id: String,
    /// Hosted checkout URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_link: Option<String>,
    /// BOLT11 invoice string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bolt11: Option<String>,
    /// Provider-side expiration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Amount section of the payment response
#[derive(Debug, Serialize)]
pub struct AmountBody {
    /// Fiat amount
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
}

/// Payment response body
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    /// Payment identifier
    pub payment_id: Uuid,
    /// Current status
    pub status: String,
    /// Monitoring deadline
    pub monitor_until: DateTime<Utc>,
    /// Provider invoice
    pub invoice: InvoiceBody,
    /// Amount and currency
    pub amount: AmountBody,
    /// Merchant metadata
    pub metadata: serde_json::Value,
    /// Merchant order reference
    pub external_code: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Finalization time, for terminal payments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Terminal status reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Convenience copy of the BOLT11 string for QR rendering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lightning_invoice: Option<String>,
}

impl PaymentResponse {
    /// Build the wire representation of a payment
    pub fn from_model(payment: &PaymentModel) -> Self {
        let invoice = match &payment.invoice {
            Some(inv) => InvoiceBody {
                provider: inv.provider.clone(),
                provider_invoice_id: inv.provider_invoice_id.clone(),
                checkout_link: inv.checkout_link.clone(),
                bolt11: inv.bolt11.clone(),
                expires_at: inv.expires_at,
            },
            // Invoice not yet assigned (CREATED or failed-before-PENDING)
            None => InvoiceBody {
                provider: "BTCPAY".to_string(),
                provider_invoice_id: String::new(),
                checkout_link: None,
                bolt11: None,
                expires_at: None,
            },
        };

        let lightning_invoice = payment
            .invoice
            .as_ref()
            .and_then(|inv| inv.bolt11.clone());

        Self {
            payment_id: payment.id,
            status: payment.status.as_str().to_string(),
            monitor_until: payment.monitor_until,
            invoice,
            amount: AmountBody {
                amount: payment.amount,
                currency: payment.currency.clone(),
            },
            metadata: payment.metadata.clone(),
            external_code: payment.external_code.clone(),
            created_at: payment.created_at,
            finalized_at: payment.finalized_at,
            status_reason: payment.status_reason.clone(),
            lightning_invoice,
        }
    }
}

/// Create a payment request
pub async fn create_payment(
    State(state): State<ApiState>,
    AuthedClient(client): AuthedClient,
    ApiJson(body): ApiJson<PaymentCreateBody>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    if !state.payment_limiter.check(&client.id.to_string()).await {
        return Err(crate::Error::RateLimited.into());
    }

    let request = CreateRequest {
        payment_method: body.payment_method,
        amount: body.amount,
        currency: body.currency,
        external_code: body.external_code,
        description: body.description,
        callback_url: body.callback_url,
        redirect_url: body.redirect_url,
        metadata: body.metadata.unwrap_or_else(|| serde_json::json!({})),
        idempotency_key: body.idempotency_key,
    };

    let outcome = state.app.engine.create(client.id, request).await?;

    if let CreateOutcome::Created(payment) = &outcome {
        if payment.status == crate::db::PaymentStatus::Pending {
            state.app.monitor.watch(payment.id);
        }
        info!(
            "API: Payment {} created for {} ({} {})",
            payment.id, client.machine_id, payment.amount, payment.currency
        );
    }

    Ok((
        StatusCode::CREATED,
        Json(PaymentResponse::from_model(outcome.payment())),
    ))
}

/// Read a payment
pub async fn get_payment(
    State(state): State<ApiState>,
    AuthedClient(client): AuthedClient,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state.app.engine.get(client.id, payment_id).await?;
    Ok(Json(PaymentResponse::from_model(&payment)))
}

/// Cancel a non-terminal payment
pub async fn cancel_payment(
    State(state): State<ApiState>,
    AuthedClient(client): AuthedClient,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state.app.engine.cancel(client.id, payment_id).await?;
    info!(
        "API: Payment {} canceled by {}",
        payment.id, client.machine_id
    );
    Ok(Json(PaymentResponse::from_model(&payment)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InvoiceModel, PaymentStatus};
    use rust_decimal_macros::dec;

    fn sample_payment() -> PaymentModel {
        let now = Utc::now();
        PaymentModel {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            external_code: "ORDER-1".to_string(),
            payment_method: "BTC_LN".to_string(),
            amount: dec!(1.00),
            currency: "EUR".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: serde_json::json!({"shelf": "A3"}),
            fingerprint: None,
            idempotency_key: None,
            status: PaymentStatus::Pending,
            status_reason: None,
            invoice: Some(InvoiceModel {
                provider: "BTCPAY".to_string(),
                provider_invoice_id: "inv-1".to_string(),
                checkout_link: Some("https://pay.example.com/i/inv-1".to_string()),
                bolt11: Some("lnbc10u1p...".to_string()),
                expires_at: None,
            }),
            created_at: now,
            monitor_until: now + chrono::Duration::seconds(120),
            finalized_at: None,
        }
    }

    #[test]
    fn test_response_shape() {
        let payment = sample_payment();
        let response = PaymentResponse::from_model(&payment);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["amount"]["amount"], "1.00");
        assert_eq!(json["amount"]["currency"], "EUR");
        assert_eq!(json["invoice"]["bolt11"], "lnbc10u1p...");
        assert_eq!(json["lightning_invoice"], "lnbc10u1p...");
        assert_eq!(json["metadata"]["shelf"], "A3");
        // Absent optionals are omitted, not null
        assert!(json.get("finalized_at").is_none());
        assert!(json.get("status_reason").is_none());
    }

    #[test]
    fn test_response_without_invoice() {
        let mut payment = sample_payment();
        payment.invoice = None;
        payment.status = PaymentStatus::Created;

        let response = PaymentResponse::from_model(&payment);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["invoice"]["provider"], "BTCPAY");
        assert_eq!(json["invoice"]["provider_invoice_id"], "");
        assert!(json.get("lightning_invoice").is_none());
    }
}
