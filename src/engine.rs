//! Payment lifecycle engine
//!
//! The engine owns every status change a payment can undergo. Three
//! asynchronous sources feed it: the client API (create, cancel), the
//! provider webhook ingress, and the monitoring worker. Each accepted
//! transition persists the new status together with exactly one event row in
//! a single transaction, then publishes the committed event to the bus.
//!
//! Racing sources are serialized per payment by the status compare-and-set
//! inside [`crate::db::PaymentQueries::transition`]: the first accepted
//! terminal wins, every later hint degrades to a no-op.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    Database, EventSource, PaymentEventModel, PaymentModel, PaymentQueries, PaymentStatus,
};
use crate::events::{EventBus, StreamEvent};
use crate::notify::CallbackNotifier;
use crate::provider::{CreateInvoiceRequest, InvoiceProvider};
use crate::{Error, PayResult};

const MAX_METADATA_BYTES: usize = 8 * 1024;

/// Advisory transition request submitted by the webhook ingress or the
/// monitoring worker. May be accepted or silently rejected against the
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionHint {
    /// Provider reported settlement
    Paid,
    /// Provider reported expiration
    Expired,
    /// Provider reported an invalid/failed invoice
    Invalid,
    /// Local monitoring deadline elapsed
    TimedOut,
    /// Provider still shows the invoice open; nothing to do
    StillPending,
}

impl TransitionHint {
    fn target_status(&self) -> Option<PaymentStatus> {
        match self {
            TransitionHint::Paid => Some(PaymentStatus::Paid),
            TransitionHint::Expired => Some(PaymentStatus::Expired),
            TransitionHint::Invalid => Some(PaymentStatus::Failed),
            TransitionHint::TimedOut => Some(PaymentStatus::TimedOut),
            TransitionHint::StillPending => None,
        }
    }
}

/// Result of submitting a hint
#[derive(Debug)]
pub enum HintOutcome {
    /// The transition was accepted and persisted
    Applied(PaymentModel),
    /// The hint was a no-op (already terminal, or transition not allowed)
    Ignored,
}

/// Result of a create call
#[derive(Debug)]
pub enum CreateOutcome {
    /// A new payment was created
    Created(PaymentModel),
    /// An idempotency key resolved to a previously created payment
    Existing(PaymentModel),
}

impl CreateOutcome {
    /// The payment either way
    pub fn payment(&self) -> &PaymentModel {
        match self {
            CreateOutcome::Created(p) | CreateOutcome::Existing(p) => p,
        }
    }
}

/// Validated payment creation parameters
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Payment method, currently only "BTC_LN"
    pub payment_method: String,
    /// Fiat amount
    pub amount: Decimal,
    /// Currency code (3-10 chars)
    pub currency: String,
    /// Merchant order reference (1-64 chars)
    pub external_code: String,
    /// Optional description
    pub description: Option<String>,
    /// Optional terminal-state callback URL
    pub callback_url: Option<String>,
    /// Optional checkout redirect URL
    pub redirect_url: Option<String>,
    /// Opaque merchant metadata
    pub metadata: serde_json::Value,
    /// Optional idempotency key
    pub idempotency_key: Option<String>,
}

impl CreateRequest {
    /// Canonical fingerprint over the fields the idempotency guard compares.
    /// serde_json maps are ordered, so serialization is deterministic.
    fn fingerprint(&self) -> String {
        serde_json::json!({
            "amount": self.amount.to_string(),
            "currency": self.currency,
            "external_code": self.external_code,
            "metadata": self.metadata,
            "payment_method": self.payment_method,
        })
        .to_string()
    }

    fn validate(&self) -> PayResult<()> {
        if self.payment_method != "BTC_LN" {
            return Err(Error::BadRequest(format!(
                "unsupported payment method: {}",
                self.payment_method
            )));
        }
        if self.amount <= Decimal::ZERO {
            return Err(Error::BadRequest("amount must be positive".to_string()));
        }
        if self.currency.len() < 3 || self.currency.len() > 10 {
            return Err(Error::BadRequest(
                "currency must be 3-10 characters".to_string(),
            ));
        }
        if self.external_code.is_empty() || self.external_code.len() > 64 {
            return Err(Error::BadRequest(
                "external_code must be 1-64 characters".to_string(),
            ));
        }
        for (field, url) in [
            ("callback_url", &self.callback_url),
            ("redirect_url", &self.redirect_url),
        ] {
            if let Some(url) = url {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|_| Error::BadRequest(format!("{} is not a valid URL", field)))?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(Error::BadRequest(format!(
                        "{} must be an http(s) URL",
                        field
                    )));
                }
            }
        }
        let metadata_len = self.metadata.to_string().len();
        if metadata_len > MAX_METADATA_BYTES {
            return Err(Error::BadRequest(format!(
                "metadata exceeds {} bytes",
                MAX_METADATA_BYTES
            )));
        }
        Ok(())
    }
}

/// The lifecycle engine
pub struct Engine {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    provider: Arc<dyn InvoiceProvider>,
    notifier: CallbackNotifier,
    config: Arc<Config>,
}

impl Engine {
    /// Create a new engine
    pub fn new(
        db: Arc<Database>,
        bus: Arc<EventBus>,
        provider: Arc<dyn InvoiceProvider>,
        notifier: CallbackNotifier,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            bus,
            provider,
            notifier,
            config,
        }
    }

    /// Create a payment: validate, resolve idempotency, persist CREATED,
    /// obtain the provider invoice and move to PENDING.
    ///
    /// Provider failure leaves the payment behind as FAILED (visible to the
    /// client) and surfaces [`Error::Provider`].
    pub async fn create(&self, client_id: Uuid, request: CreateRequest) -> PayResult<CreateOutcome> {
        request.validate()?;
        let fingerprint = request.fingerprint();

        let queries = PaymentQueries::new(&self.db);

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = queries.get_by_idempotency_key(client_id, key).await? {
                return self.resolve_idempotent(existing, &fingerprint);
            }
        }

        let now = Utc::now();
        let monitor_window = Duration::from_std(self.config.payments.monitor_window())
            .map_err(|e| Error::Internal(format!("invalid monitoring window: {}", e)))?;

        let payment = PaymentModel {
            id: Uuid::new_v4(),
            client_id,
            external_code: request.external_code.clone(),
            payment_method: request.payment_method.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
            callback_url: request.callback_url.clone(),
            redirect_url: request.redirect_url.clone(),
            metadata: request.metadata.clone(),
            fingerprint: Some(fingerprint.clone()),
            idempotency_key: request.idempotency_key.clone(),
            status: PaymentStatus::Created,
            status_reason: None,
            invoice: None,
            created_at: now,
            monitor_until: now + monitor_window,
            finalized_at: None,
        };

        let created_event = match queries.create_with_event(&payment).await {
            Ok(event) => event,
            Err(Error::Conflict(_)) => {
                // Lost a race on the idempotency key; the winner's row is
                // authoritative now.
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let existing = queries
                    .get_by_idempotency_key(client_id, key)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal("idempotency conflict without a winning row".to_string())
                    })?;
                return self.resolve_idempotent(existing, &fingerprint);
            }
            Err(e) => return Err(e),
        };
        self.bus.publish(StreamEvent::from_model(&created_event)).await;

        info!(
            "Payment {} created for client {} ({} {})",
            payment.id, client_id, payment.amount, payment.currency
        );

        let invoice_request = CreateInvoiceRequest {
            amount: request.amount,
            currency: request.currency.clone(),
            metadata: serde_json::json!({
                "payment_id": payment.id,
                "external_code": request.external_code,
                "merchant": request.metadata,
            }),
            redirect_url: request.redirect_url.clone(),
        };

        match self.provider.create_invoice(&invoice_request).await {
            Ok(invoice) => {
                match queries.attach_invoice(payment.id, &invoice).await? {
                    Some((updated, event)) => {
                        self.bus.publish(StreamEvent::from_model(&event)).await;
                        Ok(CreateOutcome::Created(updated))
                    }
                    None => {
                        // Finalized while the invoice call was in flight
                        // (e.g. canceled); return whatever won.
                        let current = queries
                            .get_any(payment.id)
                            .await?
                            .ok_or_else(|| Error::NotFound("payment".to_string()))?;
                        Ok(CreateOutcome::Created(current))
                    }
                }
            }
            Err(e) => {
                warn!("Provider invoice creation failed for {}: {}", payment.id, e);
                if let Some((failed, event)) = queries
                    .transition(
                        payment.id,
                        PaymentStatus::Failed,
                        Some("PROVIDER_ERROR"),
                        EventSource::Api,
                    )
                    .await?
                {
                    self.finish_transition(&failed, &event).await;
                }
                Err(Error::Provider("invoice creation failed".to_string()))
            }
        }
    }

    fn resolve_idempotent(
        &self,
        existing: PaymentModel,
        fingerprint: &str,
    ) -> PayResult<CreateOutcome> {
        if existing.fingerprint.as_deref() == Some(fingerprint) {
            debug!(
                "Idempotency key resolved to existing payment {}",
                existing.id
            );
            Ok(CreateOutcome::Existing(existing))
        } else {
            Err(Error::Conflict(
                "idempotency key reused with different parameters".to_string(),
            ))
        }
    }

    /// Read a payment owned by `client_id`
    pub async fn get(&self, client_id: Uuid, payment_id: Uuid) -> PayResult<PaymentModel> {
        PaymentQueries::new(&self.db)
            .get(client_id, payment_id)
            .await?
            .ok_or_else(|| Error::NotFound("payment not found".to_string()))
    }

    /// Submit an advisory transition hint. Disallowed transitions are
    /// silently ignored.
    pub async fn apply_hint(
        &self,
        payment_id: Uuid,
        hint: TransitionHint,
        reason: Option<&str>,
        source: EventSource,
    ) -> PayResult<HintOutcome> {
        let Some(target) = hint.target_status() else {
            return Ok(HintOutcome::Ignored);
        };

        let queries = PaymentQueries::new(&self.db);
        match queries.transition(payment_id, target, reason, source).await? {
            Some((payment, event)) => {
                self.finish_transition(&payment, &event).await;
                Ok(HintOutcome::Applied(payment))
            }
            None => {
                debug!(
                    "Ignored hint {:?} for payment {} (transition not allowed)",
                    hint, payment_id
                );
                Ok(HintOutcome::Ignored)
            }
        }
    }

    /// Cancel a non-terminal payment on behalf of its owning client
    pub async fn cancel(&self, client_id: Uuid, payment_id: Uuid) -> PayResult<PaymentModel> {
        let queries = PaymentQueries::new(&self.db);
        let payment = queries
            .get(client_id, payment_id)
            .await?
            .ok_or_else(|| Error::NotFound("payment not found".to_string()))?;

        if payment.status.is_terminal() {
            return Err(Error::Conflict("payment already finalized".to_string()));
        }

        match queries
            .transition(
                payment_id,
                PaymentStatus::Canceled,
                Some("CLIENT_CANCELED"),
                EventSource::Api,
            )
            .await?
        {
            Some((canceled, event)) => {
                self.finish_transition(&canceled, &event).await;
                Ok(canceled)
            }
            // Raced to terminal between the read and the CAS
            None => Err(Error::Conflict("payment already finalized".to_string())),
        }
    }

    /// Record a webhook observation that does not change the status, and
    /// fan it out as a `payment.status_changed` stream event.
    pub async fn record_webhook_log(
        &self,
        payment_id: Uuid,
        provider_event: serde_json::Value,
    ) -> PayResult<()> {
        let queries = PaymentQueries::new(&self.db);
        if let Some((_, event)) = queries
            .record_webhook_log(payment_id, provider_event)
            .await?
        {
            self.bus.publish(StreamEvent::from_model(&event)).await;
        }
        Ok(())
    }

    /// Publish a committed transition and, on terminal states, kick off the
    /// best-effort callback.
    async fn finish_transition(&self, payment: &PaymentModel, event: &PaymentEventModel) {
        self.bus.publish(StreamEvent::from_model(event)).await;

        if payment.status.is_terminal() {
            if let Some(callback_url) = payment.callback_url.clone() {
                let notifier = self.notifier.clone();
                let payload = event.payload.clone();
                tokio::spawn(async move {
                    notifier.send(&callback_url, payload).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ClientModel, ClientQueries, EventQueries, EventType};
    use crate::provider::stub::StubProvider;
    use crate::provider::InvoiceState;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: Engine,
        db: Arc<Database>,
        bus: Arc<EventBus>,
        provider: Arc<StubProvider>,
        client_id: Uuid,
    }

    async fn harness() -> Harness {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let bus = Arc::new(EventBus::new());
        let provider = Arc::new(StubProvider::new());
        let mut config = Config::default();
        config.provider.base_url = "https://stub.example.com".to_string();

        let client = ClientModel {
            id: Uuid::new_v4(),
            machine_id: "KIOSK-001".to_string(),
            password_hash: "unused".to_string(),
            is_active: true,
            allowed_ips: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_seen_at: None,
        };
        ClientQueries::new(&db).insert(&client).await.unwrap();

        let engine = Engine::new(
            db.clone(),
            bus.clone(),
            provider.clone(),
            CallbackNotifier::new("secret").unwrap(),
            Arc::new(config),
        );

        Harness {
            engine,
            db,
            bus,
            provider,
            client_id: client.id,
        }
    }

    fn sample_request(idempotency_key: Option<&str>) -> CreateRequest {
        CreateRequest {
            payment_method: "BTC_LN".to_string(),
            amount: dec!(1.00),
            currency: "EUR".to_string(),
            external_code: "ORDER-1".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: serde_json::json!({}),
            idempotency_key: idempotency_key.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_create_happy_path() {
        let h = harness().await;
        let mut rx = h.bus.subscribe(h.client_id).await;

        let outcome = h
            .engine
            .create(h.client_id, sample_request(None))
            .await
            .unwrap();
        let payment = outcome.payment();

        assert!(matches!(outcome, CreateOutcome::Created(_)));
        assert_eq!(payment.status, PaymentStatus::Pending);
        let invoice = payment.invoice.as_ref().unwrap();
        assert!(invoice.bolt11.as_ref().unwrap().starts_with("lnbc"));
        assert!(payment.monitor_until > payment.created_at);

        // Both events went over the bus, in order
        assert_eq!(rx.recv().await.unwrap().event, "payment.created");
        assert_eq!(rx.recv().await.unwrap().event, "payment.invoice_created");

        // And the log has seq 1, 2
        let events = EventQueries::new(&h.db).replay(h.client_id, 0).await.unwrap();
        assert_eq!(
            events.iter().map(|e| (e.seq, e.event_type)).collect::<Vec<_>>(),
            vec![(1, EventType::Created), (2, EventType::InvoiceCreated)]
        );
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness().await;

        let mut bad_amount = sample_request(None);
        bad_amount.amount = Decimal::ZERO;
        assert!(matches!(
            h.engine.create(h.client_id, bad_amount).await,
            Err(Error::BadRequest(_))
        ));

        let mut bad_method = sample_request(None);
        bad_method.payment_method = "CARD".to_string();
        assert!(matches!(
            h.engine.create(h.client_id, bad_method).await,
            Err(Error::BadRequest(_))
        ));

        let mut bad_currency = sample_request(None);
        bad_currency.currency = "E".to_string();
        assert!(matches!(
            h.engine.create(h.client_id, bad_currency).await,
            Err(Error::BadRequest(_))
        ));

        let mut bad_code = sample_request(None);
        bad_code.external_code = String::new();
        assert!(matches!(
            h.engine.create(h.client_id, bad_code).await,
            Err(Error::BadRequest(_))
        ));

        let mut bad_url = sample_request(None);
        bad_url.callback_url = Some("not a url".to_string());
        assert!(matches!(
            h.engine.create(h.client_id, bad_url).await,
            Err(Error::BadRequest(_))
        ));

        let mut big_metadata = sample_request(None);
        big_metadata.metadata = serde_json::json!({"blob": "x".repeat(MAX_METADATA_BYTES)});
        assert!(matches!(
            h.engine.create(h.client_id, big_metadata).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_idempotent_retry_returns_same_payment() {
        let h = harness().await;

        let first = h
            .engine
            .create(h.client_id, sample_request(Some("k-1")))
            .await
            .unwrap();
        let second = h
            .engine
            .create(h.client_id, sample_request(Some("k-1")))
            .await
            .unwrap();

        assert!(matches!(second, CreateOutcome::Existing(_)));
        assert_eq!(first.payment().id, second.payment().id);

        // No duplicate events were appended by the retry
        let events = EventQueries::new(&h.db).replay(h.client_id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_idempotency_conflict_on_changed_body() {
        let h = harness().await;

        h.engine
            .create(h.client_id, sample_request(Some("k-1")))
            .await
            .unwrap();

        let mut changed = sample_request(Some("k-1"));
        changed.amount = dec!(2.00);
        let err = h.engine.create(h.client_id, changed).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_failed_payment() {
        let h = harness().await;
        h.provider.fail_creates(true);

        let err = h
            .engine
            .create(h.client_id, sample_request(Some("k-err")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));

        // The record exists and is visible as FAILED
        let payment = PaymentQueries::new(&h.db)
            .get_by_idempotency_key(h.client_id, "k-err")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.status_reason.as_deref(), Some("PROVIDER_ERROR"));
        assert!(payment.finalized_at.is_some());
    }

    #[tokio::test]
    async fn test_apply_hint_paid_is_idempotent() {
        let h = harness().await;
        let outcome = h
            .engine
            .create(h.client_id, sample_request(None))
            .await
            .unwrap();
        let payment_id = outcome.payment().id;

        let first = h
            .engine
            .apply_hint(payment_id, TransitionHint::Paid, None, EventSource::Webhook)
            .await
            .unwrap();
        assert!(matches!(first, HintOutcome::Applied(_)));

        let second = h
            .engine
            .apply_hint(payment_id, TransitionHint::Paid, None, EventSource::Worker)
            .await
            .unwrap();
        assert!(matches!(second, HintOutcome::Ignored));

        let events = EventQueries::new(&h.db).replay(h.client_id, 0).await.unwrap();
        let paid_events = events
            .iter()
            .filter(|e| e.event_type == EventType::Paid)
            .count();
        assert_eq!(paid_events, 1);
    }

    #[tokio::test]
    async fn test_still_pending_hint_is_noop() {
        let h = harness().await;
        let outcome = h
            .engine
            .create(h.client_id, sample_request(None))
            .await
            .unwrap();

        let result = h
            .engine
            .apply_hint(
                outcome.payment().id,
                TransitionHint::StillPending,
                None,
                EventSource::Worker,
            )
            .await
            .unwrap();
        assert!(matches!(result, HintOutcome::Ignored));
    }

    #[tokio::test]
    async fn test_cancel() {
        let h = harness().await;
        let outcome = h
            .engine
            .create(h.client_id, sample_request(None))
            .await
            .unwrap();
        let payment_id = outcome.payment().id;

        let canceled = h.engine.cancel(h.client_id, payment_id).await.unwrap();
        assert_eq!(canceled.status, PaymentStatus::Canceled);
        assert_eq!(canceled.status_reason.as_deref(), Some("CLIENT_CANCELED"));

        // Cancel after terminal is rejected
        let err = h.engine.cancel(h.client_id, payment_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Not the owner -> not found
        let err = h.engine.cancel(Uuid::new_v4(), payment_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_scoped_to_owner() {
        let h = harness().await;
        let outcome = h
            .engine
            .create(h.client_id, sample_request(None))
            .await
            .unwrap();

        assert!(h.engine.get(h.client_id, outcome.payment().id).await.is_ok());
        assert!(matches!(
            h.engine.get(Uuid::new_v4(), outcome.payment().id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_monotonicity_across_sources() {
        let h = harness().await;
        let outcome = h
            .engine
            .create(h.client_id, sample_request(None))
            .await
            .unwrap();
        let payment_id = outcome.payment().id;
        h.provider
            .set_state(&outcome.payment().invoice.as_ref().unwrap().provider_invoice_id, InvoiceState::Settled);

        // Webhook wins with PAID; the worker's later TIMED_OUT must lose
        h.engine
            .apply_hint(payment_id, TransitionHint::Paid, None, EventSource::Webhook)
            .await
            .unwrap();
        let late = h
            .engine
            .apply_hint(
                payment_id,
                TransitionHint::TimedOut,
                Some("MONITOR_WINDOW_EXCEEDED"),
                EventSource::Worker,
            )
            .await
            .unwrap();
        assert!(matches!(late, HintOutcome::Ignored));

        let payment = h.engine.get(h.client_id, payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
    }
}
