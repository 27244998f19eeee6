//! Token issuance endpoint

use super::{ApiError, ApiJson, ApiState};
use crate::auth::verify_password;
use crate::db::{AuthEventQueries, ClientQueries};
use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Json,
};
use chrono::Utc;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tracing::{info, warn};
use uuid::Uuid;

/// Token request body
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// Machine identifier of the kiosk
    pub machine_id: String,
    /// Kiosk password
    pub password: String,
    /// Optional client nonce, echoed into the audit log
    #[serde(default)]
    pub nonce: Option<String>,
    /// Optional device information for the audit log
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
}

/// Token response body
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// The signed bearer token
    pub access_token: String,
    /// Always "bearer"
    pub token_type: String,
    /// Token lifetime in seconds
    pub expires_in: u64,
}

/// Issue a bearer token for a kiosk client.
///
/// Rate-limited per source IP. Credential failures return 401; an inactive
/// client or a source address outside the allow-list returns 403. Every
/// attempt lands in the auth audit log.
pub async fn issue_token(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let ip = addr.ip().to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    if !state.auth_limiter.check(&ip).await {
        return Err(crate::Error::RateLimited.into());
    }

    let clients = ClientQueries::new(&state.app.db);
    let audit = AuthEventQueries::new(&state.app.db);

    let client = match clients.get_by_machine_id(&request.machine_id).await? {
        Some(client) => client,
        None => {
            warn!("Auth failure: unknown machine_id {}", request.machine_id);
            log_failure(
                &audit,
                None,
                &ip,
                user_agent.as_deref(),
                "CLIENT_NOT_FOUND",
            )
            .await;
            return Err(ApiError::unauthorized("invalid credentials"));
        }
    };

    if !verify_password(&request.password, &client.password_hash) {
        warn!("Auth failure: bad password for {}", request.machine_id);
        log_failure(
            &audit,
            Some(client.id),
            &ip,
            user_agent.as_deref(),
            "INVALID_PASSWORD",
        )
        .await;
        return Err(ApiError::unauthorized("invalid credentials"));
    }

    if !client.is_active {
        log_failure(
            &audit,
            Some(client.id),
            &ip,
            user_agent.as_deref(),
            "CLIENT_INACTIVE",
        )
        .await;
        return Err(ApiError {
            status: axum::http::StatusCode::FORBIDDEN,
            detail: "client is inactive".to_string(),
        });
    }

    if let Some(allowed) = &client.allowed_ips {
        if !ip_allowed(allowed, addr.ip()) {
            log_failure(
                &audit,
                Some(client.id),
                &ip,
                user_agent.as_deref(),
                "IP_NOT_ALLOWED",
            )
            .await;
            return Err(ApiError {
                status: axum::http::StatusCode::FORBIDDEN,
                detail: "source address not allowed".to_string(),
            });
        }
    }

    let token = state.app.tokens.issue(client.id, &client.machine_id)?;
    clients.touch_last_seen(client.id, Utc::now()).await?;

    let _ = audit
        .record(
            Some(client.id),
            "LOGIN_OK",
            Some(&ip),
            user_agent.as_deref(),
            serde_json::json!({
                "device_info": request.device_info,
                "nonce": request.nonce,
            }),
        )
        .await;

    info!("Issued token for client {}", client.machine_id);

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        expires_in: state.app.tokens.ttl_secs(),
    }))
}

/// Check a source address against the client's allow-list. Entries are IP
/// networks in CIDR notation; bare addresses are treated as host networks.
/// Unparseable entries never match.
fn ip_allowed(allowed: &[String], ip: IpAddr) -> bool {
    allowed.iter().any(|entry| {
        let network = entry
            .parse::<IpNet>()
            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from));
        match network {
            Ok(network) => network.contains(&ip),
            Err(_) => {
                warn!("Ignoring malformed allow-list entry: {}", entry);
                false
            }
        }
    })
}

async fn log_failure(
    audit: &AuthEventQueries<'_>,
    client_id: Option<Uuid>,
    ip: &str,
    user_agent: Option<&str>,
    reason: &str,
) {
    let _ = audit
        .record(
            client_id,
            "LOGIN_FAIL",
            Some(ip),
            user_agent,
            serde_json::json!({ "reason": reason }),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ip_allowed_subnet_membership() {
        let allowed = entries(&["10.0.0.0/8"]);
        assert!(ip_allowed(&allowed, "10.1.2.3".parse().unwrap()));
        assert!(!ip_allowed(&allowed, "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_ip_allowed_host_entries() {
        // Bare addresses and /32 host networks both admit exactly one IP
        let allowed = entries(&["203.0.113.7", "198.51.100.9/32"]);
        assert!(ip_allowed(&allowed, "203.0.113.7".parse().unwrap()));
        assert!(ip_allowed(&allowed, "198.51.100.9".parse().unwrap()));
        assert!(!ip_allowed(&allowed, "203.0.113.8".parse().unwrap()));
    }

    #[test]
    fn test_ip_allowed_ipv6() {
        let allowed = entries(&["2001:db8::/32"]);
        assert!(ip_allowed(&allowed, "2001:db8::1".parse().unwrap()));
        assert!(!ip_allowed(&allowed, "2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_ip_allowed_malformed_entries_never_match() {
        let allowed = entries(&["not-an-ip", "10.0.0.0/8"]);
        assert!(ip_allowed(&allowed, "10.0.0.1".parse().unwrap()));
        assert!(!ip_allowed(&entries(&["not-an-ip"]), "10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_empty_allow_list_rejects() {
        assert!(!ip_allowed(&[], "10.0.0.1".parse().unwrap()));
    }
}
