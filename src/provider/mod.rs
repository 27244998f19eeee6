//! Lightning payment provider adapters
//!
//! The service talks to an external invoice provider over HTTP. The
//! [`InvoiceProvider`] trait covers the two calls the lifecycle engine and
//! the monitor worker need: create an invoice, fetch its current state.
//!
//! - BTCPay Server (Greenfield REST API)
//! - Stub (for testing)

pub mod btcpay;
pub mod stub;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::config::ProviderConfig;
use crate::db::InvoiceModel;
use crate::engine::TransitionHint;
use crate::PayResult;

/// Invoice creation parameters
#[derive(Debug, Clone)]
pub struct CreateInvoiceRequest {
    /// Fiat amount
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Metadata forwarded to the provider (payment id, external code, ...)
    pub metadata: serde_json::Value,
    /// Redirect target shown after checkout, if any
    pub redirect_url: Option<String>,
}

/// Provider-side invoice state, as observed by polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    /// Invoice open, no payment seen
    New,
    /// Payment seen but not yet settled
    Processing,
    /// Settled
    Settled,
    /// Expired without payment
    Expired,
    /// Marked invalid by the provider
    Invalid,
}

/// Snapshot of an invoice returned by a status fetch
#[derive(Debug, Clone)]
pub struct InvoiceSnapshot {
    /// Current provider-side state
    pub state: InvoiceState,
    /// Provider expiration timestamp, when reported
    pub expires_at: Option<DateTime<Utc>>,
}

/// Abstraction over the external invoice provider's HTTP contract
#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    /// Create an invoice and return its identifiers and payment material
    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> PayResult<InvoiceModel>;

    /// Fetch the current state of an invoice
    async fn fetch_invoice(&self, provider_invoice_id: &str) -> PayResult<InvoiceSnapshot>;

    /// Provider name recorded on the invoice sub-record
    fn name(&self) -> &'static str;
}

/// Maps provider webhook event-type strings to lifecycle transition hints.
///
/// The provider vocabulary is configurable; defaults cover the BTCPay event
/// names in both their webhook and dotted forms.
pub struct WebhookEventMap {
    mapping: HashMap<String, TransitionHint>,
}

impl WebhookEventMap {
    /// Build the map from defaults plus configuration overrides
    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut mapping = HashMap::new();
        for name in ["InvoiceSettled", "invoice.settled"] {
            mapping.insert(name.to_string(), TransitionHint::Paid);
        }
        for name in ["InvoiceExpired", "invoice.expired"] {
            mapping.insert(name.to_string(), TransitionHint::Expired);
        }
        for name in [
            "InvoiceInvalid",
            "invoice.invalid",
            "InvoiceFailed",
            "invoice.failed",
        ] {
            mapping.insert(name.to_string(), TransitionHint::Invalid);
        }

        for (event, target) in &config.event_mapping {
            let hint = match target.as_str() {
                "paid" => TransitionHint::Paid,
                "expired" => TransitionHint::Expired,
                "invalid" => TransitionHint::Invalid,
                // validated at startup; skip rather than panic on drift
                _ => continue,
            };
            mapping.insert(event.clone(), hint);
        }

        Self { mapping }
    }

    /// Resolve an event type to a hint, `None` for unmapped types
    pub fn resolve(&self, event_type: &str) -> Option<TransitionHint> {
        self.mapping.get(event_type).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping() {
        let map = WebhookEventMap::from_config(&ProviderConfig::default());
        assert_eq!(map.resolve("InvoiceSettled"), Some(TransitionHint::Paid));
        assert_eq!(map.resolve("invoice.settled"), Some(TransitionHint::Paid));
        assert_eq!(map.resolve("InvoiceExpired"), Some(TransitionHint::Expired));
        assert_eq!(map.resolve("InvoiceInvalid"), Some(TransitionHint::Invalid));
        assert_eq!(map.resolve("InvoiceProcessing"), None);
    }

    #[test]
    fn test_mapping_overrides() {
        let mut config = ProviderConfig::default();
        config
            .event_mapping
            .insert("InvoicePaidInFull".to_string(), "paid".to_string());
        let map = WebhookEventMap::from_config(&config);
        assert_eq!(map.resolve("InvoicePaidInFull"), Some(TransitionHint::Paid));
    }
}
