//! Database module for kiosk-pay
//!
//! This module handles persistent storage for:
//! - Kiosk clients and their credentials
//! - Payment requests with their provider invoice sub-record
//! - The per-client append-only payment event log
//! - Authentication audit events

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database handle
///
/// A single SQLite connection guarded by an async mutex. SQLite serializes
/// writers anyway; the mutex additionally lets multi-statement transactions
/// (status CAS + event append) run without interleaving.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = if database_url.starts_with("sqlite:") {
            database_url.strip_prefix("sqlite:").unwrap_or(database_url)
        } else {
            database_url
        };

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                machine_id TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                allowed_ips TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_seen_at TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS payment_requests (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id),
                external_code TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                description TEXT,
                callback_url TEXT,
                redirect_url TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                fingerprint TEXT,
                idempotency_key TEXT,
                status TEXT NOT NULL,
                status_reason TEXT,
                provider TEXT,
                provider_invoice_id TEXT,
                checkout_link TEXT,
                bolt11 TEXT,
                invoice_expires_at TEXT,
                created_at TEXT NOT NULL,
                monitor_until TEXT NOT NULL,
                finalized_at TEXT
            )
            "#,
            [],
        )?;

        // Serializes racing creates that share an idempotency key
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_client_idempotency
             ON payment_requests(client_id, idempotency_key)
             WHERE idempotency_key IS NOT NULL",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS payment_events (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                payment_id TEXT NOT NULL REFERENCES payment_requests(id),
                event_type TEXT NOT NULL,
                old_status TEXT,
                new_status TEXT,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (client_id, seq)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS client_auth_events (
                id TEXT PRIMARY KEY,
                client_id TEXT,
                event_type TEXT NOT NULL,
                ip TEXT,
                user_agent TEXT,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payment_requests_client
             ON payment_requests(client_id, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payment_requests_status_monitor
             ON payment_requests(status, monitor_until)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payment_requests_provider_invoice
             ON payment_requests(provider_invoice_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payment_events_client_seq
             ON payment_events(client_id, seq)",
            [],
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Check store reachability, used by the health endpoint
    pub async fn ping(&self) -> bool {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection is closed when the Arc is dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        assert!(db.ping().await);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        Database::run_migrations(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('clients', 'payment_requests', 'payment_events', 'client_auth_events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
