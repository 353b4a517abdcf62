//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::{DomainError, MoneyError, RateError};
use crate::store::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Domain errors
    #[error(transparent)]
    Domain(#[from] DomainError),

    // Server errors (5xx), except unique violations which are conflicts
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl AppError {
    /// The domain error, if this is one
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            AppError::Domain(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MoneyError> for AppError {
    fn from(err: MoneyError) -> Self {
        AppError::Domain(err.into())
    }
}

impl From<RateError> for AppError {
    fn from(err: RateError) -> Self {
        AppError::Domain(err.into())
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::InsufficientBalance { .. }
        | DomainError::InvalidAccountState(_)
        | DomainError::InvalidAmount(_)
        | DomainError::InvalidRate(_)
        | DomainError::InvalidCommand(_)
        | DomainError::SameAccountTransfer => StatusCode::BAD_REQUEST,
        DomainError::AccountNotFound(_) | DomainError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
        DomainError::TransferInProgress { .. } | DomainError::InvalidStateTransition { .. } => {
            StatusCode::CONFLICT
        }
        DomainError::LedgerNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }

            // 404 Not Found
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", Some(what.clone())),

            // Domain errors - map to appropriate HTTP status
            AppError::Domain(domain_err) => {
                if domain_err.is_integrity_fault() {
                    tracing::error!(error = %domain_err, "Ledger integrity fault");
                }
                (domain_status(domain_err), domain_err.code(), None)
            }

            // 409 Conflict
            AppError::Store(StoreError::UniqueViolation(constraint)) => {
                (StatusCode::CONFLICT, "unique_violation", Some(constraint.clone()))
            }

            // 500 Internal Server Error
            AppError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error", None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
        };

        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error,
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_invariant_violations_are_client_errors() {
        assert_eq!(
            status_of(DomainError::insufficient_balance("1001", 10, 5).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(DomainError::InvalidAccountState("frozen".to_string()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(DomainError::AccountNotFound("7".to_string()).into()),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_transfer_in_progress_is_conflict() {
        let err = DomainError::TransferInProgress {
            source_account_id: 100,
            idempotency_key: "tx-1".to_string(),
        };
        assert_eq!(status_of(err.into()), StatusCode::CONFLICT);
    }

    #[test]
    fn test_integrity_fault_is_server_error() {
        let err = DomainError::LedgerNotFound("transfer 9".to_string());
        assert_eq!(status_of(err.into()), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_store_errors() {
        assert_eq!(
            status_of(StoreError::UniqueViolation("account_account_number_key".to_string()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::Corrupt("bad status".to_string()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_money_error_conversion() {
        let err: AppError = MoneyError::NotPositive(0).into();
        assert!(matches!(err.as_domain(), Some(DomainError::InvalidAmount(_))));
    }
}
