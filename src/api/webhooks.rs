//! Provider webhook ingress
//!
//! The provider signs each notification with HMAC-SHA256 over the raw
//! request body. Signature or parse failures are the only non-2xx answers;
//! everything else is acknowledged so the provider does not retry
//! pathologically. Replayed deliveries are harmless because the lifecycle
//! engine ignores transitions out of terminal states.

use super::{ApiError, ApiState};
use crate::auth::verify_signature;
use crate::db::{EventSource, PaymentQueries};
use crate::engine::HintOutcome;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Signature header carried by provider notifications
pub const SIGNATURE_HEADER: &str = "Provider-Sig";

/// Webhook acknowledgment body
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// "processed", "ignored" or "logged"
    pub status: &'static str,
    /// Why the notification was ignored, when it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// The affected payment, when one was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
}

impl WebhookResponse {
    fn processed(payment_id: Uuid) -> Self {
        Self {
            status: "processed",
            reason: None,
            payment_id: Some(payment_id),
        }
    }

    fn ignored(reason: &'static str, payment_id: Option<Uuid>) -> Self {
        Self {
            status: "ignored",
            reason: Some(reason),
            payment_id,
        }
    }

    fn logged(payment_id: Uuid) -> Self {
        Self {
            status: "logged",
            reason: None,
            payment_id: Some(payment_id),
        }
    }
}

/// Handle a provider notification
pub async fn provider_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    // The raw body bytes are what the provider signed; any re-serialization
    // would break verification.
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing signature header"))?;

    let signature = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| ApiError::unauthorized("invalid signature format"))?;

    if !verify_signature(&state.app.config.provider.webhook_secret, &body, signature) {
        warn!("Webhook rejected: signature mismatch");
        return Err(ApiError::unauthorized("invalid signature"));
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON: {}", e)))?;

    let invoice_id = payload
        .get("invoiceId")
        .and_then(|v| v.as_str())
        .or_else(|| {
            payload
                .get("invoice")
                .and_then(|i| i.get("id"))
                .and_then(|v| v.as_str())
        })
        .ok_or_else(|| ApiError::bad_request("missing invoice ID"))?;

    let event_type = payload
        .get("type")
        .and_then(|v| v.as_str())
        .or_else(|| payload.get("eventType").and_then(|v| v.as_str()));

    let payment = match PaymentQueries::new(&state.app.db)
        .get_by_provider_invoice(invoice_id)
        .await?
    {
        Some(payment) => payment,
        None => {
            // Unknown invoices get a bland acknowledgment; existence of
            // payments must not leak through this unauthenticated path.
            debug!("Webhook for unknown invoice {}", invoice_id);
            return Ok(Json(WebhookResponse::ignored("invoice_not_found", None)));
        }
    };

    if payment.status.is_terminal() {
        return Ok(Json(WebhookResponse::ignored(
            "already_finalized",
            Some(payment.id),
        )));
    }

    let hint = event_type.and_then(|t| state.app.webhook_events.resolve(t));

    match hint {
        Some(hint) => {
            info!(
                "Webhook {} -> {:?} for payment {}",
                event_type.unwrap_or("?"),
                hint,
                payment.id
            );
            let outcome = state
                .app
                .engine
                .apply_hint(payment.id, hint, event_type, EventSource::Webhook)
                .await?;
            match outcome {
                HintOutcome::Applied(payment) => Ok(Json(WebhookResponse::processed(payment.id))),
                HintOutcome::Ignored => Ok(Json(WebhookResponse::ignored(
                    "already_finalized",
                    Some(payment.id),
                ))),
            }
        }
        None => {
            debug!(
                "Webhook with unmapped event type {:?} for payment {}",
                event_type, payment.id
            );
            state
                .app
                .engine
                .record_webhook_log(payment.id, payload)
                .await?;
            Ok(Json(WebhookResponse::logged(payment.id)))
        }
    }
}
