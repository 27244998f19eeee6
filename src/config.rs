//! Configuration management for kiosk-pay
//!
//! Configuration is loaded from TOML files; deployment secrets can be
//! overridden through `KIOSK_PAY_*` environment variables.
//!
//! # Example Configuration File
//!
//! ```toml
//! [database]
//! url = "sqlite:kiosk-pay.db"
//!
//! [auth]
//! jwt_private_key_path = "/etc/kiosk-pay/jwt_private.pem"
//! jwt_public_key_paths = ["/etc/kiosk-pay/jwt_public.pem"]
//! token_ttl_secs = 600
//!
//! [provider]
//! base_url = "https://btcpay.example.com"
//! store_id = "store-id"
//!
//! [payments]
//! monitor_window_secs = 120
//! poll_interval_secs = 5
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Payment provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Payment lifecycle configuration
    #[serde(default)]
    pub payments: PaymentsConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            provider: ProviderConfig::default(),
            payments: PaymentsConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:kiosk-pay.db".to_string()
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path to the RS256 private key used to sign tokens
    #[serde(default = "default_jwt_private_key_path")]
    pub jwt_private_key_path: PathBuf,

    /// Paths to the public keys accepted during verification. Listing more
    /// than one key allows rotating the signing key without invalidating
    /// tokens issued under the previous key.
    #[serde(default = "default_jwt_public_key_paths")]
    pub jwt_public_key_paths: Vec<PathBuf>,

    /// Token issuer identifier
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    /// Token lifetime in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Auth endpoint rate limit (requests per minute per source IP)
    #[serde(default = "default_auth_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_private_key_path: default_jwt_private_key_path(),
            jwt_public_key_paths: default_jwt_public_key_paths(),
            jwt_issuer: default_jwt_issuer(),
            token_ttl_secs: default_token_ttl(),
            rate_limit_per_minute: default_auth_rate_limit(),
        }
    }
}

fn default_jwt_private_key_path() -> PathBuf {
    PathBuf::from("./jwt_private.pem")
}

fn default_jwt_public_key_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("./jwt_public.pem")]
}

fn default_jwt_issuer() -> String {
    "kiosk-pay".to_string()
}

fn default_token_ttl() -> u64 {
    600 // 10 minutes
}

fn default_auth_rate_limit() -> u32 {
    5
}

/// Payment provider (BTCPay Server) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider base URL
    #[serde(default)]
    pub base_url: String,

    /// Provider API key
    #[serde(default)]
    pub api_key: String,

    /// Provider store identifier
    #[serde(default)]
    pub store_id: String,

    /// Shared secret for webhook HMAC verification
    #[serde(default)]
    pub webhook_secret: String,

    /// Outbound request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Invoice expiration requested from the provider, in minutes
    #[serde(default = "default_invoice_expiration")]
    pub invoice_expiration_minutes: u32,

    /// Overrides for the provider webhook event-type mapping. Keys are the
    /// provider's event-type strings, values one of "paid", "expired",
    /// "invalid".
    #[serde(default)]
    pub event_mapping: HashMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            store_id: String::new(),
            webhook_secret: String::new(),
            timeout_secs: default_provider_timeout(),
            invoice_expiration_minutes: default_invoice_expiration(),
            event_mapping: HashMap::new(),
        }
    }
}

fn default_provider_timeout() -> u64 {
    10
}

fn default_invoice_expiration() -> u32 {
    15
}

/// Payment lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    /// How long a payment is actively monitored after creation, in seconds
    #[serde(default = "default_monitor_window")]
    pub monitor_window_secs: u64,

    /// Provider polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Payment-create rate limit (requests per minute per client)
    #[serde(default = "default_payment_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            monitor_window_secs: default_monitor_window(),
            poll_interval_secs: default_poll_interval(),
            rate_limit_per_minute: default_payment_rate_limit(),
        }
    }
}

impl PaymentsConfig {
    /// Monitoring window as a [`Duration`]
    pub fn monitor_window(&self) -> Duration {
        Duration::from_secs(self.monitor_window_secs)
    }

    /// Polling interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_monitor_window() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    5
}

fn default_payment_rate_limit() -> u32 {
    60
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Apply environment variable overrides for deployment secrets. TOML
    /// files carry the structural configuration; credentials are expected to
    /// arrive through the environment in production.
    pub fn apply_env_overrides(&mut self) {
        let overrides: &mut [(&str, &mut String)] = &mut [
            ("KIOSK_PAY_DATABASE_URL", &mut self.database.url),
            ("KIOSK_PAY_PROVIDER_BASE_URL", &mut self.provider.base_url),
            ("KIOSK_PAY_PROVIDER_API_KEY", &mut self.provider.api_key),
            ("KIOSK_PAY_PROVIDER_STORE_ID", &mut self.provider.store_id),
            ("KIOSK_PAY_WEBHOOK_SECRET", &mut self.provider.webhook_secret),
            ("KIOSK_PAY_JWT_ISSUER", &mut self.auth.jwt_issuer),
            ("KIOSK_PAY_BIND_ADDRESS", &mut self.api.bind_address),
            ("KIOSK_PAY_LOG_LEVEL", &mut self.logging.level),
        ];
        for (var, target) in overrides.iter_mut() {
            if let Ok(value) = std::env::var(var) {
                **target = value;
            }
        }
        if let Ok(value) = std::env::var("KIOSK_PAY_JWT_PRIVATE_KEY_PATH") {
            self.auth.jwt_private_key_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("KIOSK_PAY_JWT_PUBLIC_KEY_PATHS") {
            self.auth.jwt_public_key_paths =
                value.split(':').map(PathBuf::from).collect();
        }
    }

    /// Resolve the database URL into a filesystem path or `:memory:`.
    pub fn resolve_database_url(&self) -> String {
        self.database.url.clone()
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.payments.monitor_window_secs == 0 {
            return Err("Monitoring window must be greater than zero".to_string());
        }

        if self.payments.poll_interval_secs == 0
            || self.payments.poll_interval_secs >= self.payments.monitor_window_secs
        {
            return Err(
                "Poll interval must be non-zero and shorter than the monitoring window"
                    .to_string(),
            );
        }

        if self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", self.api.bind_address));
        }

        if self.auth.jwt_public_key_paths.is_empty() {
            return Err("At least one JWT public key must be configured".to_string());
        }

        if self.auth.token_ttl_secs == 0 {
            return Err("Token TTL must be greater than zero".to_string());
        }

        if self.provider.base_url.is_empty() {
            return Err("Provider base URL is not configured".to_string());
        }

        for target in self.provider.event_mapping.values() {
            if !matches!(target.as_str(), "paid" | "expired" | "invalid") {
                return Err(format!(
                    "Invalid event mapping target: {} (expected paid, expired or invalid)",
                    target
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.provider.base_url = "https://btcpay.example.com".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.payments.monitor_window_secs, 120);
        assert_eq!(config.payments.poll_interval_secs, 5);
        assert_eq!(config.auth.token_ttl_secs, 600);
        assert_eq!(config.auth.rate_limit_per_minute, 5);
        assert_eq!(config.payments.rate_limit_per_minute, 60);
    }

    #[test]
    fn test_validate_config() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        // Poll interval must stay inside the monitoring window
        config.payments.poll_interval_secs = 300;
        assert!(config.validate().is_err());

        config.payments.poll_interval_secs = 5;
        config.api.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_event_mapping() {
        let mut config = valid_config();
        config
            .provider
            .event_mapping
            .insert("InvoiceSettled".to_string(), "paid".to_string());
        assert!(config.validate().is_ok());

        config
            .provider
            .event_mapping
            .insert("InvoiceSettled".to_string(), "done".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [payments]
            monitor_window_secs = 60

            [provider]
            base_url = "https://pay.example.com"
            store_id = "store-1"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.payments.monitor_window_secs, 60);
        assert_eq!(config.payments.poll_interval_secs, 5);
        assert_eq!(config.provider.store_id, "store-1");
    }
}
