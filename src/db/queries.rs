//! Database queries
//!
//! Query structs follow a common pattern: they borrow the [`Database`],
//! take the connection lock per call, and run multi-statement work inside a
//! single transaction so the status CAS and the event append commit together.

use super::{
    ClientModel, Database, EventSource, EventType, InvoiceModel, PaymentEventModel, PaymentModel,
    PaymentStatus,
};
use crate::{Error, PayResult};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "id, client_id, external_code, payment_method, amount, currency, \
     description, callback_url, redirect_url, metadata, fingerprint, idempotency_key, status, \
     status_reason, provider, provider_invoice_id, checkout_link, bolt11, invoice_expires_at, \
     created_at, monitor_until, finalized_at";

const EVENT_COLUMNS: &str =
    "id, client_id, seq, payment_id, event_type, old_status, new_status, source, payload, created_at";

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))
}

fn parse_status(idx: usize, s: &str) -> rusqlite::Result<PaymentStatus> {
    PaymentStatus::parse(s).ok_or_else(|| {
        conversion_err(
            idx,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown payment status: {}", s),
            ),
        )
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentModel> {
    let amount_str: String = row.get(4)?;
    let amount =
        Decimal::from_str_exact(&amount_str).map_err(|e| conversion_err(4, e))?;
    let metadata_str: String = row.get(9)?;
    let metadata =
        serde_json::from_str(&metadata_str).map_err(|e| conversion_err(9, e))?;
    let status_str: String = row.get(12)?;

    let provider: Option<String> = row.get(14)?;
    let invoice = match provider {
        Some(provider) => Some(InvoiceModel {
            provider,
            provider_invoice_id: row.get(15)?,
            checkout_link: row.get(16)?,
            bolt11: row.get(17)?,
            expires_at: row.get(18)?,
        }),
        None => None,
    };

    Ok(PaymentModel {
        id: parse_uuid(0, row.get(0)?)?,
        client_id: parse_uuid(1, row.get(1)?)?,
        external_code: row.get(2)?,
        payment_method: row.get(3)?,
        amount,
        currency: row.get(5)?,
        description: row.get(6)?,
        callback_url: row.get(7)?,
        redirect_url: row.get(8)?,
        metadata,
        fingerprint: row.get(10)?,
        idempotency_key: row.get(11)?,
        status: parse_status(12, &status_str)?,
        status_reason: row.get(13)?,
        invoice,
        created_at: row.get(19)?,
        monitor_until: row.get(20)?,
        finalized_at: row.get(21)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentEventModel> {
    let event_type_str: String = row.get(4)?;
    let event_type = EventType::parse(&event_type_str).ok_or_else(|| {
        conversion_err(
            4,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown event type: {}", event_type_str),
            ),
        )
    })?;
    let old_status: Option<String> = row.get(5)?;
    let new_status: Option<String> = row.get(6)?;
    let source_str: String = row.get(7)?;
    let source = EventSource::parse(&source_str).ok_or_else(|| {
        conversion_err(
            7,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown event source: {}", source_str),
            ),
        )
    })?;
    let payload_str: String = row.get(8)?;
    let payload =
        serde_json::from_str(&payload_str).map_err(|e| conversion_err(8, e))?;

    Ok(PaymentEventModel {
        id: parse_uuid(0, row.get(0)?)?,
        client_id: parse_uuid(1, row.get(1)?)?,
        seq: row.get(2)?,
        payment_id: parse_uuid(3, row.get(3)?)?,
        event_type,
        old_status: old_status.as_deref().and_then(PaymentStatus::parse),
        new_status: new_status.as_deref().and_then(PaymentStatus::parse),
        source,
        payload,
        created_at: row.get(9)?,
    })
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientModel> {
    let allowed_ips: Option<String> = row.get(4)?;
    let allowed_ips = match allowed_ips {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| conversion_err(4, e))?),
        None => None,
    };

    Ok(ClientModel {
        id: parse_uuid(0, row.get(0)?)?,
        machine_id: row.get(1)?,
        password_hash: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        allowed_ips,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        last_seen_at: row.get(7)?,
    })
}

/// Append an event row inside an open transaction, assigning the next dense
/// per-client sequence number.
fn append_event(
    tx: &Transaction<'_>,
    payment: &PaymentModel,
    event_type: EventType,
    old_status: Option<PaymentStatus>,
    new_status: Option<PaymentStatus>,
    source: EventSource,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<PaymentEventModel> {
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM payment_events WHERE client_id = ?1",
        params![payment.client_id.to_string()],
        |row| row.get(0),
    )?;

    let event = PaymentEventModel {
        id: Uuid::new_v4(),
        client_id: payment.client_id,
        seq,
        payment_id: payment.id,
        event_type,
        old_status,
        new_status,
        source,
        payload,
        created_at,
    };

    tx.execute(
        r#"
        INSERT INTO payment_events
            (id, client_id, seq, payment_id, event_type, old_status, new_status, source, payload, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            event.id.to_string(),
            event.client_id.to_string(),
            event.seq,
            event.payment_id.to_string(),
            event.event_type.as_str(),
            event.old_status.map(|s| s.as_str()),
            event.new_status.map(|s| s.as_str()),
            event.source.as_str(),
            event.payload.to_string(),
            event.created_at,
        ],
    )?;

    Ok(event)
}

fn select_payment(tx: &Transaction<'_>, payment_id: Uuid) -> rusqlite::Result<Option<PaymentModel>> {
    tx.query_row(
        &format!("SELECT {} FROM payment_requests WHERE id = ?1", PAYMENT_COLUMNS),
        params![payment_id.to_string()],
        payment_from_row,
    )
    .optional()
}

/// Client queries
pub struct ClientQueries<'a> {
    db: &'a Database,
}

impl<'a> ClientQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new client
    pub async fn insert(&self, client: &ClientModel) -> PayResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO clients
                (id, machine_id, password_hash, is_active, allowed_ips, created_at, updated_at, last_seen_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                client.id.to_string(),
                client.machine_id,
                client.password_hash,
                client.is_active as i64,
                client
                    .allowed_ips
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                client.created_at,
                client.updated_at,
                client.last_seen_at,
            ],
        )?;
        info!("DB: Created client: machine_id={}", client.machine_id);
        Ok(())
    }

    /// Look a client up by machine identifier
    pub async fn get_by_machine_id(&self, machine_id: &str) -> PayResult<Option<ClientModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                "SELECT id, machine_id, password_hash, is_active, allowed_ips, created_at, updated_at, last_seen_at
                 FROM clients WHERE machine_id = ?1",
                params![machine_id],
                client_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Look a client up by ID
    pub async fn get_by_id(&self, id: Uuid) -> PayResult<Option<ClientModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                "SELECT id, machine_id, password_hash, is_active, allowed_ips, created_at, updated_at, last_seen_at
                 FROM clients WHERE id = ?1",
                params![id.to_string()],
                client_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Record a successful authentication
    pub async fn touch_last_seen(&self, id: Uuid, at: DateTime<Utc>) -> PayResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE clients SET last_seen_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![at, id.to_string()],
        )?;
        Ok(())
    }
}

/// Payment request queries
pub struct PaymentQueries<'a> {
    db: &'a Database,
}

impl<'a> PaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a freshly validated CREATED payment and its first event in one
    /// transaction. A unique-constraint failure on the idempotency index maps
    /// to [`Error::Conflict`] so the caller can re-read the winning row.
    pub async fn create_with_event(&self, payment: &PaymentModel) -> PayResult<PaymentEventModel> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "INSERT INTO payment_requests ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                PAYMENT_COLUMNS
            ),
            params![
                payment.id.to_string(),
                payment.client_id.to_string(),
                payment.external_code,
                payment.payment_method,
                payment.amount.to_string(),
                payment.currency,
                payment.description,
                payment.callback_url,
                payment.redirect_url,
                payment.metadata.to_string(),
                payment.fingerprint,
                payment.idempotency_key,
                payment.status.as_str(),
                payment.status_reason,
                payment.invoice.as_ref().map(|i| i.provider.clone()),
                payment.invoice.as_ref().map(|i| i.provider_invoice_id.clone()),
                payment.invoice.as_ref().and_then(|i| i.checkout_link.clone()),
                payment.invoice.as_ref().and_then(|i| i.bolt11.clone()),
                payment.invoice.as_ref().and_then(|i| i.expires_at),
                payment.created_at,
                payment.monitor_until,
                payment.finalized_at,
            ],
        )
        .map_err(map_unique_violation)?;

        let event = appended_with_seq(
            &tx,
            payment,
            EventType::Created,
            None,
            Some(PaymentStatus::Created),
            EventSource::Api,
            payment.created_at,
        )?;

        tx.commit()?;

        info!(
            "DB: Created payment request: id={}, client_id={}, external_code={}",
            payment.id, payment.client_id, payment.external_code
        );

        Ok(event)
    }

    /// Get a payment owned by a specific client
    pub async fn get(&self, client_id: Uuid, payment_id: Uuid) -> PayResult<Option<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payment_requests WHERE id = ?1 AND client_id = ?2",
                    PAYMENT_COLUMNS
                ),
                params![payment_id.to_string(), client_id.to_string()],
                payment_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Get a payment regardless of owner (internal paths)
    pub async fn get_any(&self, payment_id: Uuid) -> PayResult<Option<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM payment_requests WHERE id = ?1", PAYMENT_COLUMNS),
                params![payment_id.to_string()],
                payment_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Resolve an idempotency key to its payment
    pub async fn get_by_idempotency_key(
        &self,
        client_id: Uuid,
        key: &str,
    ) -> PayResult<Option<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payment_requests WHERE client_id = ?1 AND idempotency_key = ?2",
                    PAYMENT_COLUMNS
                ),
                params![client_id.to_string(), key],
                payment_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Resolve a provider invoice ID to its payment
    pub async fn get_by_provider_invoice(
        &self,
        provider_invoice_id: &str,
    ) -> PayResult<Option<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payment_requests WHERE provider_invoice_id = ?1",
                    PAYMENT_COLUMNS
                ),
                params![provider_invoice_id],
                payment_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Attach the provider invoice and move CREATED -> PENDING, appending the
    /// invoice-created event in the same transaction. Returns `None` when the
    /// payment is no longer in CREATED or already carries an invoice (the
    /// invoice sub-record is immutable once assigned).
    pub async fn attach_invoice(
        &self,
        payment_id: Uuid,
        invoice: &InvoiceModel,
    ) -> PayResult<Option<(PaymentModel, PaymentEventModel)>> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let payment = match select_payment(&tx, payment_id)? {
            Some(p) => p,
            None => return Ok(None),
        };

        if payment.status != PaymentStatus::Created || payment.invoice.is_some() {
            return Ok(None);
        }

        let updated = tx.execute(
            "UPDATE payment_requests
             SET status = ?1, provider = ?2, provider_invoice_id = ?3, checkout_link = ?4,
                 bolt11 = ?5, invoice_expires_at = ?6
             WHERE id = ?7 AND status = ?8 AND provider IS NULL",
            params![
                PaymentStatus::Pending.as_str(),
                invoice.provider,
                invoice.provider_invoice_id,
                invoice.checkout_link,
                invoice.bolt11,
                invoice.expires_at,
                payment_id.to_string(),
                PaymentStatus::Created.as_str(),
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let payment = select_payment(&tx, payment_id)?
            .ok_or_else(|| Error::Internal("payment vanished during invoice attach".into()))?;

        let now = Utc::now();
        let event = appended_with_seq(
            &tx,
            &payment,
            EventType::InvoiceCreated,
            Some(PaymentStatus::Created),
            Some(PaymentStatus::Pending),
            EventSource::Api,
            now,
        )?;

        tx.commit()?;

        info!(
            "DB: Attached invoice to payment {}: provider_invoice_id={}",
            payment_id, invoice.provider_invoice_id
        );

        Ok(Some((payment, event)))
    }

    /// Apply a status transition under the row CAS, appending the matching
    /// event in the same transaction. Returns `None` when the transition is
    /// not allowed from the payment's current status (idempotent no-op).
    pub async fn transition(
        &self,
        payment_id: Uuid,
        new_status: PaymentStatus,
        reason: Option<&str>,
        source: EventSource,
    ) -> PayResult<Option<(PaymentModel, PaymentEventModel)>> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let payment = match select_payment(&tx, payment_id)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let old_status = payment.status;
        if !old_status.can_transition_to(new_status) {
            return Ok(None);
        }

        let now = Utc::now();
        let finalized_at = if new_status.is_terminal() { Some(now) } else { None };

        let updated = tx.execute(
            "UPDATE payment_requests
             SET status = ?1, status_reason = COALESCE(?2, status_reason), finalized_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                new_status.as_str(),
                reason,
                finalized_at,
                payment_id.to_string(),
                old_status.as_str(),
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let payment = select_payment(&tx, payment_id)?
            .ok_or_else(|| Error::Internal("payment vanished during transition".into()))?;

        let event = appended_with_seq(
            &tx,
            &payment,
            EventType::for_status(new_status),
            Some(old_status),
            Some(new_status),
            source,
            now,
        )?;

        tx.commit()?;

        info!(
            "DB: Payment {} transitioned {} -> {} (source={})",
            payment_id,
            old_status,
            new_status,
            source.as_str()
        );

        Ok(Some((payment, event)))
    }

    /// Record a webhook observation that did not change the payment status.
    pub async fn record_webhook_log(
        &self,
        payment_id: Uuid,
        provider_event: serde_json::Value,
    ) -> PayResult<Option<(PaymentModel, PaymentEventModel)>> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let payment = match select_payment(&tx, payment_id)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let now = Utc::now();
        let seq_probe: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM payment_events WHERE client_id = ?1",
            params![payment.client_id.to_string()],
            |row| row.get(0),
        )?;
        let mut payload = payment.event_payload(seq_probe, EventType::WebhookReceived, now);
        payload["provider_event"] = provider_event;

        let event = append_event(
            &tx,
            &payment,
            EventType::WebhookReceived,
            Some(payment.status),
            Some(payment.status),
            EventSource::Webhook,
            payload,
            now,
        )?;

        tx.commit()?;

        Ok(Some((payment, event)))
    }

    /// List payments the startup sweeper must reconcile
    pub async fn list_recoverable(&self) -> PayResult<Vec<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payment_requests WHERE status IN (?1, ?2) ORDER BY created_at",
            PAYMENT_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![
                PaymentStatus::Created.as_str(),
                PaymentStatus::Pending.as_str()
            ],
            payment_from_row,
        )?;

        let mut payments = Vec::new();
        for row in rows {
            payments.push(row?);
        }
        Ok(payments)
    }
}

/// Build the snapshot payload with the event's own seq and append it. Two
/// steps because the payload embeds the sequence number being assigned.
fn appended_with_seq(
    tx: &Transaction<'_>,
    payment: &PaymentModel,
    event_type: EventType,
    old_status: Option<PaymentStatus>,
    new_status: Option<PaymentStatus>,
    source: EventSource,
    now: DateTime<Utc>,
) -> rusqlite::Result<PaymentEventModel> {
    let seq_probe: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM payment_events WHERE client_id = ?1",
        params![payment.client_id.to_string()],
        |row| row.get(0),
    )?;
    let payload = payment.event_payload(seq_probe, event_type, now);
    append_event(tx, payment, event_type, old_status, new_status, source, payload, now)
}

fn map_unique_violation(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
            return Error::Conflict("idempotency key already in use".to_string());
        }
    }
    Error::Database(e)
}

/// Payment event queries
pub struct EventQueries<'a> {
    db: &'a Database,
}

impl<'a> EventQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Replay persisted events for a client, in sequence order, starting
    /// after `after_seq`.
    pub async fn replay(
        &self,
        client_id: Uuid,
        after_seq: i64,
    ) -> PayResult<Vec<PaymentEventModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payment_events WHERE client_id = ?1 AND seq > ?2 ORDER BY seq",
            EVENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![client_id.to_string(), after_seq], event_from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Highest assigned sequence number for a client (0 when none)
    pub async fn latest_seq(&self, client_id: Uuid) -> PayResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let seq = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM payment_events WHERE client_id = ?1",
            params![client_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

/// Authentication audit queries
pub struct AuthEventQueries<'a> {
    db: &'a Database,
}

impl<'a> AuthEventQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Record an authentication attempt
    pub async fn record(
        &self,
        client_id: Option<Uuid>,
        event_type: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        details: serde_json::Value,
    ) -> PayResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO client_auth_events (id, client_id, event_type, ip, user_agent, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                Uuid::new_v4().to_string(),
                client_id.map(|id| id.to_string()),
                event_type,
                ip,
                user_agent,
                details.to_string(),
                Utc::now(),
            ],
        )?;
        Ok(())
    }
}
