//! Error types and handling for the gateway.
//!
//! Component errors ([`CacheError`](crate::core::cache::CacheError),
//! [`StoreError`](crate::core::store::StoreError), forwarding and selection
//! errors) are converted into [`AppError`] at the orchestrator boundary, where
//! each variant maps to one fixed HTTP status.

use crate::core::rate_limiter::RateLimitDecision;
use crate::core::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_PERMISSION: &str = "permission_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_API: &str = "api_error";

/// Why a presented credential was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingCredential,
    InvalidKey,
    Disabled,
    Expired,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AuthFailure::MissingCredential => "missing API key",
            AuthFailure::InvalidKey => "invalid API key",
            AuthFailure::Disabled => "API key is disabled",
            AuthFailure::Expired => "API key has expired",
        };
        f.write_str(reason)
    }
}

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthenticated(AuthFailure),

    #[error("Forbidden: API key does not have access to group '{group}'")]
    Forbidden { group: String },

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group is disabled: {0}")]
    GroupDisabled(String),

    #[error("Rate limit exceeded")]
    RateLimited(RateLimitDecision),

    #[error("No providers available for group: {0}")]
    NoProviderAvailable(String),

    #[error("Upstream provider '{provider}' timed out after {timeout_ms} ms")]
    UpstreamTimeout { provider: String, timeout_ms: u64 },

    #[error("Upstream provider '{provider}' unreachable: {message}")]
    UpstreamUnreachable { provider: String, message: String },

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::GroupNotFound(_) | AppError::GroupDisabled(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::NoProviderAvailable(_)
            | AppError::UpstreamTimeout { .. }
            | AppError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            AppError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) => ERROR_TYPE_AUTHENTICATION,
            AppError::Forbidden { .. } => ERROR_TYPE_PERMISSION,
            AppError::GroupNotFound(_) | AppError::GroupDisabled(_) => ERROR_TYPE_NOT_FOUND,
            AppError::RateLimited(_) => ERROR_TYPE_RATE_LIMIT,
            AppError::NoProviderAvailable(_)
            | AppError::UpstreamTimeout { .. }
            | AppError::UpstreamUnreachable { .. } => ERROR_TYPE_UPSTREAM,
            AppError::DependencyUnavailable(_) | AppError::Internal(_) => ERROR_TYPE_API,
        }
    }

    /// Message returned to the caller. Rejection reasons for credentials
    /// stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Unauthenticated(_) => "Unauthorized: Invalid or missing API key".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::DependencyUnavailable(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.client_message(),
                "type": self.error_type(),
                "code": status.as_u16()
            }
        }));

        let mut response = (status, body).into_response();
        if let AppError::RateLimited(decision) = &self {
            decision.apply_headers(response.headers_mut());
        }
        response
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
