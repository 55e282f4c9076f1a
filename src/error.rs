use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::accounts_client::AccountsError;
use crate::config::ConfigError;
use crate::dispute::DisputeError;
use crate::lifecycle::LifecycleError;
use crate::mixing_engine::MixingError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Unauthorized,
    RateLimited,
    TokenUnsupported(String),
    LimitExceeded(String),
    PoolUnavailable,
    DisputeNotApplicable,
    DisputeExpired,
    StoreError(String),
    MixingError(String),
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::TokenUnsupported(_) => StatusCode::BAD_REQUEST,
            AppError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            AppError::PoolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DisputeNotApplicable => StatusCode::BAD_REQUEST,
            AppError::DisputeExpired => StatusCode::BAD_REQUEST,
            AppError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::MixingError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::TokenUnsupported(_) => "TOKEN_UNSUPPORTED",
            AppError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            AppError::PoolUnavailable => "POOL_UNAVAILABLE",
            AppError::DisputeNotApplicable => "DISPUTE_NOT_APPLICABLE",
            AppError::DisputeExpired => "DISPUTE_EXPIRED",
            AppError::StoreError(_) => "STORE_ERROR",
            AppError::MixingError(_) => "MIXING_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the sanitized message shown to clients. Internal details
    /// are logged server-side only.
    fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::Unauthorized => "unauthorized".into(),
            AppError::RateLimited => "rate limited".into(),
            AppError::TokenUnsupported(t) => format!("token not supported: {t}"),
            AppError::LimitExceeded(msg) => msg.clone(),
            AppError::PoolUnavailable => "pool accounts unavailable, try again later".into(),
            AppError::DisputeNotApplicable => "request has not reached a delivered state".into(),
            AppError::DisputeExpired => "dispute grace period has elapsed".into(),
            AppError::StoreError(_) => "internal error".into(),
            AppError::MixingError(_) => "internal error".into(),
            AppError::Internal(_) => "internal error".into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.public_message(), self.error_code())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::StoreError(msg) | AppError::MixingError(msg) | AppError::Internal(msg) => {
                error!(error = %msg, code = self.error_code(), "request failed");
            }
            _ => {}
        }

        let status = self.status_code();
        let body = json!({
            "error": self.public_message(),
            "code": self.error_code(),
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::BadRequest(format!("unknown request: {id}")),
            StoreError::Backend(msg) => AppError::StoreError(msg),
        }
    }
}

impl From<AccountsError> for AppError {
    fn from(e: AccountsError) -> Self {
        match e {
            AccountsError::InsufficientPool => AppError::PoolUnavailable,
            AccountsError::AuthFailed => AppError::Unauthorized,
            e => AppError::MixingError(e.to_string()),
        }
    }
}

impl From<MixingError> for AppError {
    fn from(e: MixingError) -> Self {
        AppError::MixingError(e.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<LifecycleError> for AppError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::InvalidInput(msg) => AppError::BadRequest(msg),
            LifecycleError::TokenUnsupported(t) => AppError::TokenUnsupported(t),
            LifecycleError::LimitExceeded(msg) => AppError::LimitExceeded(msg),
            LifecycleError::PoolUnavailable(_) => AppError::PoolUnavailable,
            LifecycleError::NotFound(id) => AppError::NotFound(format!("unknown request: {id}")),
            LifecycleError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<DisputeError> for AppError {
    fn from(e: DisputeError) -> Self {
        match e {
            DisputeError::NotApplicable => AppError::DisputeNotApplicable,
            DisputeError::Expired => AppError::DisputeExpired,
            DisputeError::Store(e) => AppError::StoreError(e.to_string()),
            DisputeError::Fulfiller(msg) => AppError::MixingError(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_never_leak_message() {
        let err = AppError::StoreError("leaky backend detail".into());
        assert_eq!(err.public_message(), "internal error");
        let err = AppError::MixingError("accounts service is down".into());
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn validation_errors_surface_message() {
        let err = AppError::BadRequest("targets must be non-empty".into());
        assert_eq!(err.public_message(), "targets must be non-empty");
    }
}
