//! HTTP API for the payment service
//!
//! Endpoints:
//! - `POST /api/v1/auth/token`: issue a bearer token
//! - `POST /api/v1/payments`: create a payment (idempotent)
//! - `GET /api/v1/payments/:id`: read a payment
//! - `POST /api/v1/payments/:id/cancel`: cancel a non-terminal payment
//! - `GET /api/v1/events/stream`: live event stream (text/event-stream)
//! - `POST /api/v1/webhooks/provider`: provider callback
//! - `GET /health`: liveness + store reachability

use crate::db::{ClientModel, ClientQueries};
use crate::ratelimit::RateLimiter;
use crate::{Error, PayApp};
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

mod auth;
mod events;
mod health;
mod payments;
mod webhooks;

pub use auth::*;
pub use events::*;
pub use health::*;
pub use payments::*;
pub use webhooks::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The payment application
    pub app: PayApp,
    /// Auth endpoint limiter, keyed by source IP
    pub auth_limiter: Arc<RateLimiter>,
    /// Payment-create limiter, keyed by client ID
    pub payment_limiter: Arc<RateLimiter>,
}

/// Build the API router
fn build_router(app: PayApp) -> Router {
    let state = ApiState {
        auth_limiter: Arc::new(RateLimiter::new(app.config.auth.rate_limit_per_minute)),
        payment_limiter: Arc::new(RateLimiter::new(app.config.payments.rate_limit_per_minute)),
        app,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/auth/token", post(issue_token))
        .route("/api/v1/payments", post(create_payment))
        .route("/api/v1/payments/:payment_id", get(get_payment))
        .route("/api/v1/payments/:payment_id/cancel", post(cancel_payment))
        .route("/api/v1/events/stream", get(event_stream))
        .route("/api/v1/webhooks/provider", post(provider_webhook))
        .with_state(state)
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: PayApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();

    let router = build_router(app);

    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
        info!("Received shutdown signal, stopping API server...");
    })
    .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// API error response. The wire body is always `{"detail": "<message>"}`;
/// internal failures are logged with a correlation id and never leak.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Human-readable message
    pub detail: String,
}

impl ApiError {
    /// 400 with a message
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    /// 401 with a message
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            detail: detail.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, detail) = match err {
            Error::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Error::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, detail),
            Error::Forbidden(detail) => (StatusCode::FORBIDDEN, detail),
            Error::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Error::Conflict(detail) => (StatusCode::CONFLICT, detail),
            Error::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded".to_string(),
            ),
            Error::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "payment provider unavailable".to_string(),
            ),
            err @ (Error::Database(_) | Error::Config(_) | Error::Internal(_)) => {
                let correlation_id = Uuid::new_v4();
                error!(%correlation_id, "Internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error (ref {})", correlation_id),
                )
            }
        };
        Self { status, detail }
    }
}

/// The authenticated client, extracted from the `Authorization` header.
///
/// Verifies the bearer token against the public key set, then reloads the
/// client row; tokens of deactivated or deleted clients fail verification.
pub struct AuthedClient(
    /// The verified client row
    pub ClientModel,
);

#[async_trait]
impl FromRequestParts<ApiState> for AuthedClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("expected bearer token"))?;

        let claims = state.app.tokens.verify(token)?;
        let client_id = claims.client_id()?;

        let client = ClientQueries::new(&state.app.db)
            .get_by_id(client_id)
            .await?
            .ok_or_else(|| ApiError::unauthorized("unknown client"))?;

        if !client.is_active {
            return Err(ApiError::unauthorized("client is inactive"));
        }

        Ok(AuthedClient(client))
    }
}

/// JSON extractor that reports malformed bodies in the API error format
pub struct ApiJson<T>(
    /// The deserialized body
    pub T,
);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}
