//! Payment monitoring workers
//!
//! Every payment that enters PENDING gets a bounded polling task: it checks
//! the provider's invoice state on a fixed interval until a terminal status
//! is reached through any source, the monitoring deadline passes, or the
//! provider becomes unreachable. Workers are advisory: they only ever submit
//! hints to the lifecycle engine and never bypass the transition rules, so
//! running one twice for the same payment is harmless.
//!
//! Workers are not durable. On startup [`PaymentMonitor::recover`] scans the
//! store for non-terminal payments and either respawns a worker or, for
//! payments already past their deadline, applies the timeout directly.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{Database, EventSource, PaymentQueries, PaymentStatus};
use crate::engine::{Engine, TransitionHint};
use crate::provider::{InvoiceProvider, InvoiceState};
use crate::PayResult;

/// Consecutive provider errors tolerated before the payment is failed
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Reason recorded when the monitoring window elapses
pub const REASON_WINDOW_EXCEEDED: &str = "MONITOR_WINDOW_EXCEEDED";
/// Reason recorded when the provider stops answering
pub const REASON_PROVIDER_UNREACHABLE: &str = "PROVIDER_UNREACHABLE";

/// Spawns and supervises per-payment polling workers
pub struct PaymentMonitor {
    engine: Arc<Engine>,
    db: Arc<Database>,
    provider: Arc<dyn InvoiceProvider>,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl PaymentMonitor {
    /// Create a new monitor
    pub fn new(
        engine: Arc<Engine>,
        db: Arc<Database>,
        provider: Arc<dyn InvoiceProvider>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            db,
            provider,
            poll_interval,
            shutdown_tx,
        }
    }

    /// Spawn a polling worker for a payment
    pub fn watch(&self, payment_id: Uuid) {
        let engine = self.engine.clone();
        let db = self.db.clone();
        let provider = self.provider.clone();
        let poll_interval = self.poll_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) =
                run_worker(engine, db, provider, poll_interval, shutdown_rx, payment_id).await
            {
                error!("Monitor worker for payment {} failed: {}", payment_id, e);
            }
        });
    }

    /// Startup sweeper: reconcile payments left non-terminal by a previous
    /// process. Returns how many were claimed or finalized.
    pub async fn recover(&self) -> PayResult<usize> {
        let queries = PaymentQueries::new(&self.db);
        let recoverable = queries.list_recoverable().await?;
        let mut recovered = 0;

        for payment in recoverable {
            if chrono::Utc::now() >= payment.monitor_until {
                debug!(
                    "Recovered payment {} is past its deadline, timing out",
                    payment.id
                );
                self.engine
                    .apply_hint(
                        payment.id,
                        TransitionHint::TimedOut,
                        Some(REASON_WINDOW_EXCEEDED),
                        EventSource::Worker,
                    )
                    .await?;
            } else {
                debug!("Re-claiming monitor worker for payment {}", payment.id);
                self.watch(payment.id);
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Signal all workers to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_worker(
    engine: Arc<Engine>,
    db: Arc<Database>,
    provider: Arc<dyn InvoiceProvider>,
    poll_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    payment_id: Uuid,
) -> PayResult<()> {
    let mut ticker = interval(poll_interval);
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => {
                debug!("Monitor worker for payment {} received shutdown", payment_id);
                return Ok(());
            }
        }

        // Reload first: the webhook may have finalized the payment since the
        // last tick.
        let queries = PaymentQueries::new(&db);
        let payment = match queries.get_any(payment_id).await? {
            Some(p) => p,
            None => {
                warn!("Monitor worker: payment {} not found, exiting", payment_id);
                return Ok(());
            }
        };

        if payment.status.is_terminal() {
            debug!(
                "Payment {} reached {} elsewhere, monitor worker exiting",
                payment_id, payment.status
            );
            return Ok(());
        }

        if chrono::Utc::now() >= payment.monitor_until {
            info!(
                "Payment {} hit the monitoring deadline without a terminal signal",
                payment_id
            );
            engine
                .apply_hint(
                    payment_id,
                    TransitionHint::TimedOut,
                    Some(REASON_WINDOW_EXCEEDED),
                    EventSource::Worker,
                )
                .await?;
            return Ok(());
        }

        // A payment still in CREATED has no invoice to poll; wait for the
        // deadline or for the pending transition to catch up.
        let Some(invoice) = payment.invoice.as_ref().filter(|_| payment.status == PaymentStatus::Pending) else {
            continue;
        };

        match provider.fetch_invoice(&invoice.provider_invoice_id).await {
            Ok(snapshot) => {
                consecutive_errors = 0;
                let hint = match snapshot.state {
                    InvoiceState::Settled => TransitionHint::Paid,
                    InvoiceState::Expired => TransitionHint::Expired,
                    InvoiceState::Invalid => TransitionHint::Invalid,
                    InvoiceState::New | InvoiceState::Processing => TransitionHint::StillPending,
                };
                if hint != TransitionHint::StillPending {
                    info!(
                        "Monitor worker observed {:?} for payment {}",
                        snapshot.state, payment_id
                    );
                    engine
                        .apply_hint(payment_id, hint, None, EventSource::Worker)
                        .await?;
                    return Ok(());
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "Provider poll failed for payment {} ({}/{}): {}",
                    payment_id, consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    engine
                        .apply_hint(
                            payment_id,
                            TransitionHint::Invalid,
                            Some(REASON_PROVIDER_UNREACHABLE),
                            EventSource::Worker,
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{ClientModel, ClientQueries};
    use crate::engine::{CreateOutcome, CreateRequest};
    use crate::events::EventBus;
    use crate::notify::CallbackNotifier;
    use crate::provider::stub::StubProvider;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Harness {
        monitor: PaymentMonitor,
        engine: Arc<Engine>,
        db: Arc<Database>,
        provider: Arc<StubProvider>,
        client_id: Uuid,
    }

    async fn harness(poll_millis: u64) -> Harness {
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

        let engine = Arc::new(Engine::new(
            db.clone(),
            bus,
            provider.clone(),
            CallbackNotifier::new("secret").unwrap(),
            Arc::new(config),
        ));

        let monitor = PaymentMonitor::new(
            engine.clone(),
            db.clone(),
            provider.clone(),
            Duration::from_millis(poll_millis),
        );

        Harness {
            monitor,
            engine,
            db,
            provider,
            client_id: client.id,
        }
    }

    async fn create_pending(h: &Harness) -> crate::db::PaymentModel {
        let request = CreateRequest {
            payment_method: "BTC_LN".to_string(),
            amount: dec!(1.00),
            currency: "EUR".to_string(),
            external_code: "ORDER-1".to_string(),
            description: None,
            callback_url: None,
            redirect_url: None,
            metadata: serde_json::json!({}),
            idempotency_key: None,
        };
        match h.engine.create(h.client_id, request).await.unwrap() {
            CreateOutcome::Created(p) => p,
            CreateOutcome::Existing(p) => p,
        }
    }

    async fn wait_for_status(
        h: &Harness,
        payment_id: Uuid,
        status: PaymentStatus,
    ) -> crate::db::PaymentModel {
        for _ in 0..100 {
            let payment = PaymentQueries::new(&h.db)
                .get_any(payment_id)
                .await
                .unwrap()
                .unwrap();
            if payment.status == status {
                return payment;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("payment never reached {:?}", status);
    }

    #[tokio::test]
    async fn test_worker_observes_settlement() {
        let h = harness(10).await;
        let payment = create_pending(&h).await;
        let invoice_id = payment.invoice.as_ref().unwrap().provider_invoice_id.clone();

        h.provider.set_state(&invoice_id, InvoiceState::Settled);
        h.monitor.watch(payment.id);

        let paid = wait_for_status(&h, payment.id, PaymentStatus::Paid).await;
        assert!(paid.finalized_at.is_some());
    }

    #[tokio::test]
    async fn test_worker_times_out_at_deadline() {
        let h = harness(10).await;
        let payment = create_pending(&h).await;

        // Force the deadline into the past
        {
            let conn = h.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "UPDATE payment_requests SET monitor_until = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now() - chrono::Duration::seconds(1), payment.id.to_string()],
            )
            .unwrap();
        }

        h.monitor.watch(payment.id);
        let timed_out = wait_for_status(&h, payment.id, PaymentStatus::TimedOut).await;
        assert_eq!(
            timed_out.status_reason.as_deref(),
            Some(REASON_WINDOW_EXCEEDED)
        );
    }

    #[tokio::test]
    async fn test_worker_fails_after_consecutive_errors() {
        let h = harness(10).await;
        let payment = create_pending(&h).await;

        h.provider.fail_fetches(true);
        h.monitor.watch(payment.id);

        let failed = wait_for_status(&h, payment.id, PaymentStatus::Failed).await;
        assert_eq!(
            failed.status_reason.as_deref(),
            Some(REASON_PROVIDER_UNREACHABLE)
        );
    }

    #[tokio::test]
    async fn test_worker_exits_when_already_terminal() {
        let h = harness(10).await;
        let payment = create_pending(&h).await;

        h.engine
            .apply_hint(payment.id, TransitionHint::Paid, None, EventSource::Webhook)
            .await
            .unwrap();

        // Running a worker on the already-terminal payment changes nothing
        h.monitor.watch(payment.id);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = PaymentQueries::new(&h.db)
            .get_any(payment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_recover_respawns_and_times_out() {
        let h = harness(10).await;

        // One payment still inside its window, one already expired
        let fresh = create_pending(&h).await;
        let stale = create_pending(&h).await;
        {
            let conn = h.db.conn();
            let conn = conn.lock().await;
            conn.execute(
                "UPDATE payment_requests SET monitor_until = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now() - chrono::Duration::seconds(5), stale.id.to_string()],
            )
            .unwrap();
        }

        let recovered = h.monitor.recover().await.unwrap();
        assert_eq!(recovered, 2);

        // The stale one was finalized synchronously
        let stale_after = PaymentQueries::new(&h.db)
            .get_any(stale.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale_after.status, PaymentStatus::TimedOut);

        // The fresh one has a live worker; settle it through the provider
        h.provider.set_state(
            &fresh.invoice.as_ref().unwrap().provider_invoice_id,
            InvoiceState::Settled,
        );
        wait_for_status(&h, fresh.id, PaymentStatus::Paid).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let h = harness(10).await;
        let payment = create_pending(&h).await;

        h.monitor.watch(payment.id);
        h.monitor.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Payment untouched after shutdown even though the provider would
        // report settled now
        h.provider.set_state(
            &payment.invoice.as_ref().unwrap().provider_invoice_id,
            InvoiceState::Settled,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = PaymentQueries::new(&h.db)
            .get_any(payment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, PaymentStatus::Pending);
    }
}
