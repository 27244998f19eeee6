//! kiosk-pay: a payment orchestration service for unattended vending kiosks
//!
//! This crate sits between kiosk terminals and an external Lightning payment
//! provider (a BTCPay-Server-compatible HTTP API):
//!
//! - **Authenticated kiosks** request payments for fiat amounts and receive a
//!   BOLT11 invoice plus checkout URL
//! - **Lifecycle engine**: a per-payment state machine with strict monotonic
//!   status progression and a bounded monitoring deadline
//! - **Event stream**: an append-only per-client event log with gap-free
//!   sequence numbers, delivered over SSE with reconnect-and-replay
//! - **Webhook ingress**: HMAC-verified provider notifications, backed up by
//!   a polling worker when webhooks are delayed or lost
//!
//! # Architecture
//!
//! Control flow for a payment: API -> auth -> idempotency check -> lifecycle
//! engine persists CREATED -> provider invoice created -> PENDING persisted
//! and published -> monitor worker spawned. Afterwards the webhook ingress,
//! the monitor worker and explicit cancels all feed transition hints into the
//! engine; accepted transitions append an event and fan out to subscribers.
//!
#![warn(missing_docs)]

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod monitor;
pub mod notify;
pub mod provider;
pub mod ratelimit;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

pub use config::Config;
use db::Database;
use engine::Engine;
use events::EventBus;
use monitor::PaymentMonitor;
use notify::CallbackNotifier;
use provider::btcpay::BtcPayProvider;
use provider::WebhookEventMap;

/// The main application state, shared across the API, the webhook ingress and
/// the background monitor workers.
#[derive(Clone)]
pub struct PayApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// SQLite-backed persistent store
    pub db: Arc<Database>,
    /// In-process event fan-out to live stream subscribers
    pub bus: Arc<EventBus>,
    /// Payment lifecycle engine
    pub engine: Arc<Engine>,
    /// Per-payment monitor workers + startup sweeper
    pub monitor: Arc<PaymentMonitor>,
    /// Bearer token mint/verify service
    pub tokens: Arc<auth::TokenService>,
    /// Provider webhook event-type mapping
    pub webhook_events: Arc<WebhookEventMap>,
}

impl PayApp {
    /// Create a new application instance and wire up all components.
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing kiosk-pay application...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);

        let tokens = Arc::new(auth::TokenService::from_config(&config.auth)?);

        let provider: Arc<dyn provider::InvoiceProvider> =
            Arc::new(BtcPayProvider::new(&config.provider)?);
        let webhook_events = Arc::new(WebhookEventMap::from_config(&config.provider));

        let bus = Arc::new(EventBus::new());
        let notifier = CallbackNotifier::new(&config.provider.webhook_secret)?;

        let engine = Arc::new(Engine::new(
            db.clone(),
            bus.clone(),
            provider.clone(),
            notifier,
            config.clone(),
        ));

        let monitor = Arc::new(PaymentMonitor::new(
            engine.clone(),
            db.clone(),
            provider,
            config.payments.poll_interval(),
        ));

        info!("kiosk-pay application initialized successfully");

        Ok(Self {
            config,
            db,
            bus,
            engine,
            monitor,
            tokens,
            webhook_events,
        })
    }

    /// Run the application until the shutdown signal fires.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting kiosk-pay application...");

        // Re-claim payments that were mid-monitoring when the process last
        // stopped, before accepting new traffic.
        match self.monitor.recover().await {
            Ok(count) if count > 0 => info!("Recovered {} in-flight payments", count),
            Ok(_) => {}
            Err(e) => error!("Failed to recover in-flight payments: {}", e),
        }

        api::serve_with_shutdown(self.clone(), shutdown_rx).await?;

        Ok(())
    }

    /// Shut the application down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down kiosk-pay application...");
        self.monitor.shutdown();
        self.db.close().await;
        info!("kiosk-pay application shutdown complete");
        Ok(())
    }
}

/// Error types for the payment service
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Request validation failure
    #[error("validation error: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource absent or not owned by the caller
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency key reused with a different request body
    #[error("conflict: {0}")]
    Conflict(String),

    /// Token bucket exceeded
    #[error("rate limit exceeded")]
    RateLimited,

    /// Upstream payment provider failure
    #[error("provider error: {0}")]
    Provider(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for payment service operations
pub type PayResult<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failure: {}", e))
    }
}
