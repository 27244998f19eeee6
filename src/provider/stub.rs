//! Stub provider implementation
//!
//! For testing and development. Hands out fake invoices and reports whatever
//! state the test scripted for them.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::debug;

use super::{CreateInvoiceRequest, InvoiceProvider, InvoiceSnapshot, InvoiceState};
use crate::db::InvoiceModel;
use crate::{Error, PayResult};

/// Stub provider implementation
pub struct StubProvider {
    states: Mutex<HashMap<String, InvoiceState>>,
    counter: AtomicU32,
    fail_creates: Mutex<bool>,
    fail_fetches: Mutex<bool>,
}

impl StubProvider {
    /// Create a new stub provider
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
            fail_creates: Mutex::new(false),
            fail_fetches: Mutex::new(false),
        }
    }

    /// Script the state reported for an invoice
    pub fn set_state(&self, provider_invoice_id: &str, state: InvoiceState) {
        self.states
            .lock()
            .unwrap()
            .insert(provider_invoice_id.to_string(), state);
    }

    /// Make subsequent invoice creations fail
    pub fn fail_creates(&self, fail: bool) {
        *self.fail_creates.lock().unwrap() = fail;
    }

    /// Make subsequent status fetches fail
    pub fn fail_fetches(&self, fail: bool) {
        *self.fail_fetches.lock().unwrap() = fail;
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceProvider for StubProvider {
    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> PayResult<InvoiceModel> {
        if *self.fail_creates.lock().unwrap() {
            return Err(Error::Provider("stub: invoice creation disabled".to_string()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("stub-inv-{}", n);
        self.states
            .lock()
            .unwrap()
            .insert(id.clone(), InvoiceState::New);

        debug!(
            "Stub provider: created invoice {} for {} {}",
            id, request.amount, request.currency
        );

        Ok(InvoiceModel {
            provider: self.name().to_string(),
            provider_invoice_id: id.clone(),
            checkout_link: Some(format!("https://stub.example.com/i/{}", id)),
            bolt11: Some(format!("lnbc1stub{}", n)),
            expires_at: Some(Utc::now() + Duration::minutes(15)),
        })
    }

    async fn fetch_invoice(&self, provider_invoice_id: &str) -> PayResult<InvoiceSnapshot> {
        if *self.fail_fetches.lock().unwrap() {
            return Err(Error::Provider("stub: fetch disabled".to_string()));
        }

        let states = self.states.lock().unwrap();
        let state = states
            .get(provider_invoice_id)
            .copied()
            .ok_or_else(|| Error::Provider("stub: unknown invoice".to_string()))?;

        Ok(InvoiceSnapshot {
            state,
            expires_at: None,
        })
    }

    fn name(&self) -> &'static str {
        "STUB"
    }
}
