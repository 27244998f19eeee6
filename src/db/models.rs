//! Database models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment request status.
///
/// Transitions follow a strict partial order; terminal statuses are
/// absorbing. See [`PaymentStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Request recorded, no provider invoice yet
    Created,
    /// Invoice assigned, awaiting payment
    Pending,
    /// Provider reported settlement
    Paid,
    /// Provider reported expiration
    Expired,
    /// Local monitoring deadline reached without a terminal signal
    TimedOut,
    /// Provider or internal error
    Failed,
    /// Client-initiated cancel
    Canceled,
}

impl PaymentStatus {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "CREATED",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::TimedOut => "TIMED_OUT",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Canceled => "CANCELED",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(PaymentStatus::Created),
            "PENDING" => Some(PaymentStatus::Pending),
            "PAID" => Some(PaymentStatus::Paid),
            "EXPIRED" => Some(PaymentStatus::Expired),
            "TIMED_OUT" => Some(PaymentStatus::TimedOut),
            "FAILED" => Some(PaymentStatus::Failed),
            "CANCELED" => Some(PaymentStatus::Canceled),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Paid
                | PaymentStatus::Expired
                | PaymentStatus::TimedOut
                | PaymentStatus::Failed
                | PaymentStatus::Canceled
        )
    }

    /// Whether the transition `self -> next` is allowed.
    ///
    /// CREATED may time out directly: a crash between recording the request
    /// and invoice creation leaves rows the startup sweeper must be able to
    /// finalize.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Created, Pending)
                | (Created, Failed)
                | (Created, Canceled)
                | (Created, TimedOut)
                | (Pending, Paid)
                | (Pending, Expired)
                | (Pending, TimedOut)
                | (Pending, Failed)
                | (Pending, Canceled)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted payment event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Payment request recorded
    Created,
    /// Provider invoice attached, payment now pending
    InvoiceCreated,
    /// Provider webhook observed without a status change
    WebhookReceived,
    /// Terminal: paid
    Paid,
    /// Terminal: provider expiration
    Expired,
    /// Terminal: monitoring deadline
    TimedOut,
    /// Terminal: failure
    Failed,
    /// Terminal: client cancel
    Canceled,
}

impl EventType {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::InvoiceCreated => "PROVIDER_INVOICE_CREATED",
            EventType::WebhookReceived => "WEBHOOK_RECEIVED",
            EventType::Paid => "PAID",
            EventType::Expired => "EXPIRED",
            EventType::TimedOut => "TIMED_OUT",
            EventType::Failed => "FAILED",
            EventType::Canceled => "CANCELED",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(EventType::Created),
            "PROVIDER_INVOICE_CREATED" => Some(EventType::InvoiceCreated),
            "WEBHOOK_RECEIVED" => Some(EventType::WebhookReceived),
            "PAID" => Some(EventType::Paid),
            "EXPIRED" => Some(EventType::Expired),
            "TIMED_OUT" => Some(EventType::TimedOut),
            "FAILED" => Some(EventType::Failed),
            "CANCELED" => Some(EventType::Canceled),
            _ => None,
        }
    }

    /// Event name used on the wire (SSE `event:` field and callback bodies)
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventType::Created => "payment.created",
            EventType::InvoiceCreated => "payment.invoice_created",
            EventType::WebhookReceived => "payment.status_changed",
            EventType::Paid => "payment.paid",
            EventType::Expired => "payment.expired",
            EventType::TimedOut => "payment.timed_out",
            EventType::Failed => "payment.failed",
            EventType::Canceled => "payment.canceled",
        }
    }

    /// The event emitted when a payment reaches `status`
    pub fn for_status(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Created => EventType::Created,
            PaymentStatus::Pending => EventType::InvoiceCreated,
            PaymentStatus::Paid => EventType::Paid,
            PaymentStatus::Expired => EventType::Expired,
            PaymentStatus::TimedOut => EventType::TimedOut,
            PaymentStatus::Failed => EventType::Failed,
            PaymentStatus::Canceled => EventType::Canceled,
        }
    }
}

/// Which subsystem produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// Client-facing API handler
    Api,
    /// Monitoring worker
    Worker,
    /// Provider webhook ingress
    Webhook,
}

impl EventSource {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Api => "API",
            EventSource::Worker => "WORKER",
            EventSource::Webhook => "WEBHOOK",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "API" => Some(EventSource::Api),
            "WORKER" => Some(EventSource::Worker),
            "WEBHOOK" => Some(EventSource::Webhook),
            _ => None,
        }
    }
}

/// Kiosk client database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientModel {
    /// Client ID
    pub id: Uuid,
    /// Human-facing machine identifier (unique)
    pub machine_id: String,
    /// Argon2id password hash
    pub password_hash: String,
    /// Whether the client may authenticate
    pub is_active: bool,
    /// Optional allow-list of source networks (CIDR notation; bare
    /// addresses admit a single host)
    pub allowed_ips: Option<Vec<String>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Last successful authentication time
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Provider invoice sub-record, set at most once per payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceModel {
    /// Provider name
    pub provider: String,
    /// Provider-side invoice identifier
    pub provider_invoice_id: String,
    /// Hosted checkout URL
    pub checkout_link: Option<String>,
    /// BOLT11 Lightning invoice string
    pub bolt11: Option<String>,
    /// Provider-side invoice expiration
    pub expires_at: Option<DateTime<Utc>>,
}

/// Payment request database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentModel {
    /// Payment ID
    pub id: Uuid,
    /// Owning client
    pub client_id: Uuid,
    /// Merchant-supplied order reference (not unique)
    pub external_code: String,
    /// Payment method, currently always "BTC_LN"
    pub payment_method: String,
    /// Fiat amount (fixed-point decimal)
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Optional free-form description
    pub description: Option<String>,
    /// Optional client callback URL for terminal notifications
    pub callback_url: Option<String>,
    /// Optional checkout redirect URL
    pub redirect_url: Option<String>,
    /// Opaque merchant metadata
    pub metadata: serde_json::Value,
    /// Canonical request fingerprint used by the idempotency guard
    pub fingerprint: Option<String>,
    /// Caller-supplied idempotency key, unique per client
    pub idempotency_key: Option<String>,
    /// Current status
    pub status: PaymentStatus,
    /// Reason recorded alongside terminal statuses
    pub status_reason: Option<String>,
    /// Provider invoice, present once the payment reached PENDING
    pub invoice: Option<InvoiceModel>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Monitoring deadline
    pub monitor_until: DateTime<Utc>,
    /// Set when a terminal status is reached
    pub finalized_at: Option<DateTime<Utc>>,
}

impl PaymentModel {
    /// JSON snapshot of the payment's observable state, as carried by stream
    /// events and callbacks.
    pub fn event_payload(
        &self,
        seq: i64,
        event: EventType,
        emitted_at: DateTime<Utc>,
    ) -> serde_json::Value {
        let invoice = self.invoice.as_ref().map(|inv| {
            serde_json::json!({
                "provider": inv.provider,
                "provider_invoice_id": inv.provider_invoice_id,
                "checkout_link": inv.checkout_link,
                "bolt11": inv.bolt11,
                "expires_at": inv.expires_at.map(|t| t.to_rfc3339()),
            })
        });

        serde_json::json!({
            "event_id": seq,
            "event": event.wire_name(),
            "emitted_at": emitted_at.to_rfc3339(),
            "payment": {
                "payment_id": self.id,
                "external_code": self.external_code,
                "status": self.status.as_str(),
                "status_reason": self.status_reason,
                "created_at": self.created_at.to_rfc3339(),
                "finalized_at": self.finalized_at.map(|t| t.to_rfc3339()),
                "monitor_until": self.monitor_until.to_rfc3339(),
                "amount": {
                    "amount": self.amount,
                    "currency": self.currency,
                },
                "payment_method": self.payment_method,
            },
            "invoice": invoice,
        })
    }
}

/// Payment event database model: one append-only row per observable change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventModel {
    /// Event ID
    pub id: Uuid,
    /// Owning client (denormalized for per-client replay)
    pub client_id: Uuid,
    /// Dense per-client sequence number, starting at 1
    pub seq: i64,
    /// Payment this event belongs to
    pub payment_id: Uuid,
    /// Event type
    pub event_type: EventType,
    /// Status before the transition, if any
    pub old_status: Option<PaymentStatus>,
    /// Status after the transition, if any
    pub new_status: Option<PaymentStatus>,
    /// Producing subsystem
    pub source: EventSource,
    /// JSON snapshot payload
    pub payload: serde_json::Value,
    /// Emission time
    pub created_at: DateTime<Utc>,
}

/// Authentication audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEventModel {
    /// Event ID
    pub id: Uuid,
    /// Client, when the machine id resolved to one
    pub client_id: Option<Uuid>,
    /// LOGIN_OK or LOGIN_FAIL
    pub event_type: String,
    /// Source address
    pub ip: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Structured details (failure reason, device info)
    pub details: serde_json::Value,
    /// Event time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            PaymentStatus::Created,
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Expired,
            PaymentStatus::TimedOut,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("SETTLED"), None);
    }

    #[test]
    fn test_transition_table() {
        use PaymentStatus::*;

        assert!(Created.can_transition_to(Pending));
        assert!(Created.can_transition_to(Failed));
        assert!(Created.can_transition_to(Canceled));
        assert!(Created.can_transition_to(TimedOut));
        assert!(!Created.can_transition_to(Paid));
        assert!(!Created.can_transition_to(Expired));

        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Expired));
        assert!(Pending.can_transition_to(TimedOut));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Created));

        // Terminals are absorbing
        for terminal in [Paid, Expired, TimedOut, Failed, Canceled] {
            assert!(terminal.is_terminal());
            for next in [Created, Pending, Paid, Expired, TimedOut, Failed, Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_event_wire_names() {
        assert_eq!(EventType::Created.wire_name(), "payment.created");
        assert_eq!(EventType::InvoiceCreated.wire_name(), "payment.invoice_created");
        assert_eq!(EventType::WebhookReceived.wire_name(), "payment.status_changed");
        assert_eq!(EventType::Paid.wire_name(), "payment.paid");
        assert_eq!(EventType::TimedOut.wire_name(), "payment.timed_out");
    }
}
