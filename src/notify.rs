//! Outbound callback notifications
//!
//! When a payment with a configured `callback_url` reaches a terminal
//! status, a best-effort POST delivers the event snapshot to the client.
//! Deliveries are signed the same way inbound webhooks are verified, retried
//! with exponential backoff and never surfaced to the payment flow.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::sign_payload;
use crate::{Error, PayResult};

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort callback sender
#[derive(Clone)]
pub struct CallbackNotifier {
    http: Client,
    secret: String,
}

impl CallbackNotifier {
    /// Create a new notifier signing callbacks with `secret`
    pub fn new(secret: &str) -> PayResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            secret: secret.to_string(),
        })
    }

    /// Deliver a terminal-state notification. Attempts are spaced 1 s, 5 s,
    /// 25 s apart; returns whether any attempt succeeded.
    pub async fn send(&self, callback_url: &str, payload: serde_json::Value) -> bool {
        let body = payload.to_string();
        let signature = sign_payload(&self.secret, body.as_bytes());

        let mut delay = Duration::from_secs(1);
        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .http
                .post(callback_url)
                .header("Content-Type", "application/json")
                .header("X-Signature", format!("sha256={}", signature))
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("Callback delivered to {} (attempt {})", callback_url, attempt);
                    return true;
                }
                Ok(response) => {
                    warn!(
                        "Callback to {} returned {} (attempt {}/{})",
                        callback_url,
                        response.status(),
                        attempt,
                        MAX_ATTEMPTS
                    );
                }
                Err(e) => {
                    warn!(
                        "Callback to {} failed (attempt {}/{}): {}",
                        callback_url, attempt, MAX_ATTEMPTS, e
                    );
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 5;
            }
        }

        warn!(
            "Giving up on callback to {} after {} attempts",
            callback_url, MAX_ATTEMPTS
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_construction() {
        let notifier = CallbackNotifier::new("secret").unwrap();
        // Clones share the same client and secret
        let _ = notifier.clone();
    }
}
