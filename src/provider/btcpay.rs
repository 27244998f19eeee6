//! BTCPay Server provider implementation
//!
//! Integrates with the BTCPay Greenfield REST API: invoice creation against
//! a store, status fetches, and BOLT11 extraction from the invoice's
//! payment-methods resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CreateInvoiceRequest, InvoiceProvider, InvoiceSnapshot, InvoiceState};
use crate::config::ProviderConfig;
use crate::db::InvoiceModel;
use crate::{Error, PayResult};

/// BTCPay Greenfield API client
pub struct BtcPayProvider {
    http: Client,
    base_url: String,
    api_key: String,
    store_id: String,
    invoice_expiration_minutes: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceResponse {
    id: String,
    status: Option<String>,
    checkout_link: Option<String>,
    // Unix seconds or RFC3339, depending on the provider version
    #[serde(default, deserialize_with = "de_expiration")]
    expiration_time: Option<DateTime<Utc>>,
}

fn de_expiration<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentMethodResponse {
    payment_method_id: Option<String>,
    destination: Option<String>,
    payment_link: Option<String>,
}

impl BtcPayProvider {
    /// Create a new BTCPay provider from configuration
    pub fn new(config: &ProviderConfig) -> PayResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            store_id: config.store_id.clone(),
            invoice_expiration_minutes: config.invoice_expiration_minutes,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/stores/{}{}",
            self.base_url, self.store_id, path
        )
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> PayResult<T> {
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("token {}", self.api_key))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Provider(format!("provider returned {}", status)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Provider(format!("malformed provider response: {}", e)))
    }

    /// Extract the BOLT11 string from the invoice's Lightning payment method.
    ///
    /// BTCPay reports it either in `destination` or as a `lightning:` link.
    async fn fetch_bolt11(&self, invoice_id: &str) -> PayResult<Option<String>> {
        let url = self.url(&format!("/invoices/{}/payment-methods", invoice_id));
        let methods: Vec<PaymentMethodResponse> = self.get_json(&url).await?;

        for method in methods {
            let id = method.payment_method_id.as_deref().unwrap_or("");
            if id != "BTC-LN" && id != "BTC-LightningNetwork" {
                continue;
            }

            if let Some(destination) = method.destination {
                if destination.starts_with("lnbc") {
                    return Ok(Some(destination));
                }
            }
            if let Some(link) = method.payment_link {
                let bolt11 = link.strip_prefix("lightning:").unwrap_or(&link);
                if bolt11.starts_with("lnbc") {
                    return Ok(Some(bolt11.to_string()));
                }
            }
        }

        Ok(None)
    }

    fn map_status(status: Option<&str>) -> InvoiceState {
        match status {
            Some("Settled") => InvoiceState::Settled,
            Some("Expired") => InvoiceState::Expired,
            Some("Invalid") => InvoiceState::Invalid,
            Some("Processing") => InvoiceState::Processing,
            _ => InvoiceState::New,
        }
    }
}

#[async_trait]
impl InvoiceProvider for BtcPayProvider {
    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> PayResult<InvoiceModel> {
        debug!(
            "Creating provider invoice: amount={} {}",
            request.amount, request.currency
        );

        let body = serde_json::json!({
            "amount": request.amount.to_string(),
            "currency": request.currency,
            "type": "Standard",
            "checkout": {
                "speedPolicy": "MediumSpeed",
                "expirationMinutes": self.invoice_expiration_minutes,
                "monitoringMinutes": 0,
                "paymentMethods": ["BTC-LightningNetwork"],
                "redirectURL": request.redirect_url,
            },
            "metadata": request.metadata,
        });

        let response = self
            .http
            .post(self.url("/invoices"))
            .header("Authorization", format!("token {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("invoice creation failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!("Provider invoice creation failed: {} {}", status, detail);
            return Err(Error::Provider(format!("provider returned {}", status)));
        }

        let invoice: InvoiceResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("malformed provider response: {}", e)))?;

        // The create response frequently omits the Lightning payment method;
        // it materializes shortly after on the payment-methods resource.
        let bolt11 = match self.fetch_bolt11(&invoice.id).await {
            Ok(Some(bolt11)) => Some(bolt11),
            Ok(None) => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.fetch_bolt11(&invoice.id).await.unwrap_or(None)
            }
            Err(e) => {
                warn!("Failed to fetch BOLT11 for invoice {}: {}", invoice.id, e);
                None
            }
        };

        debug!("Provider invoice created: id={}", invoice.id);

        Ok(InvoiceModel {
            provider: self.name().to_string(),
            provider_invoice_id: invoice.id,
            checkout_link: invoice.checkout_link,
            bolt11,
            expires_at: invoice.expiration_time,
        })
    }

    async fn fetch_invoice(&self, provider_invoice_id: &str) -> PayResult<InvoiceSnapshot> {
        let url = self.url(&format!("/invoices/{}", provider_invoice_id));
        let invoice: InvoiceResponse = self.get_json(&url).await?;

        Ok(InvoiceSnapshot {
            state: Self::map_status(invoice.status.as_deref()),
            expires_at: invoice.expiration_time,
        })
    }

    fn name(&self) -> &'static str {
        "BTCPAY"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BtcPayProvider::map_status(Some("Settled")), InvoiceState::Settled);
        assert_eq!(BtcPayProvider::map_status(Some("Expired")), InvoiceState::Expired);
        assert_eq!(BtcPayProvider::map_status(Some("Invalid")), InvoiceState::Invalid);
        assert_eq!(
            BtcPayProvider::map_status(Some("Processing")),
            InvoiceState::Processing
        );
        assert_eq!(BtcPayProvider::map_status(Some("New")), InvoiceState::New);
        assert_eq!(BtcPayProvider::map_status(None), InvoiceState::New);
    }

    #[test]
    fn test_expiration_parsing() {
        let from_unix: InvoiceResponse =
            serde_json::from_str(r#"{"id":"i","expirationTime":1735689600}"#).unwrap();
        assert!(from_unix.expiration_time.is_some());

        let from_iso: InvoiceResponse =
            serde_json::from_str(r#"{"id":"i","expirationTime":"2025-01-01T00:00:00Z"}"#).unwrap();
        assert!(from_iso.expiration_time.is_some());
        assert_eq!(from_unix.expiration_time, from_iso.expiration_time);

        let missing: InvoiceResponse = serde_json::from_str(r#"{"id":"i"}"#).unwrap();
        assert!(missing.expiration_time.is_none());
    }

    #[test]
    fn test_url_building() {
        let mut config = ProviderConfig::default();
        config.base_url = "https://btcpay.example.com/".to_string();
        config.store_id = "store-1".to_string();
        let provider = BtcPayProvider::new(&config).unwrap();
        assert_eq!(
            provider.url("/invoices/abc"),
            "https://btcpay.example.com/api/v1/stores/store-1/invoices/abc"
        );
    }
}
