//! Engine error handling
//!
//! One error type for every engine operation. Domain errors carry the
//! specific rejection reason back to the caller; infrastructure failures
//! collapse into `Unavailable` with the detail logged internally only.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::money::MoneyError;

/// Engine error type with caller-facing codes
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds in wallet {wallet_id}")]
    InsufficientFunds { wallet_id: Uuid },

    #[error("Invalid loan state: {0}")]
    InvalidLoanState(String),

    #[error("Funding of {attempted} exceeds remaining amount {remaining} on loan {loan_id}")]
    FundingExceedsRequestedAmount {
        loan_id: Uuid,
        attempted: rust_decimal::Decimal,
        remaining: rust_decimal::Decimal,
    },

    #[error("Repayment schedule already exists for loan {0}")]
    ScheduleAlreadyExists(Uuid),

    #[error("Repayment {0} is already settled")]
    AlreadySettled(Uuid),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Transient store conflict (serialization failure, deadlock). Retried
    /// internally and surfaced as `Unavailable` once retries are exhausted.
    #[error("Transaction conflict: {0}")]
    Conflict(String),
}

/// JSON error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Error details in the response
#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl EngineError {
    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::InvalidAmount(_) => "INVALID_AMOUNT",
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::InvalidLoanState(_) => "INVALID_LOAN_STATE",
            EngineError::FundingExceedsRequestedAmount { .. } => {
                "FUNDING_EXCEEDS_REQUESTED_AMOUNT"
            }
            EngineError::ScheduleAlreadyExists(_) => "SCHEDULE_ALREADY_EXISTS",
            EngineError::AlreadySettled(_) => "ALREADY_SETTLED",
            EngineError::NotAuthorized(_) => "NOT_AUTHORIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Unavailable(_) | EngineError::Conflict(_) => "UNAVAILABLE",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            EngineError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidLoanState(_) => StatusCode::CONFLICT,
            EngineError::FundingExceedsRequestedAmount { .. } => StatusCode::CONFLICT,
            EngineError::ScheduleAlreadyExists(_) => StatusCode::CONFLICT,
            EngineError::AlreadySettled(_) => StatusCode::CONFLICT,
            EngineError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Unavailable(_) | EngineError::Conflict(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Infrastructure failures, as opposed to business rejections
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Conflict(_))
    }

    /// Message safe to show to the end user
    pub fn user_message(&self) -> String {
        if self.is_infrastructure() {
            "The service is temporarily unavailable, please try again".to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        if self.is_infrastructure() {
            tracing::error!(error = %self, code = %error_code, "Engine infrastructure failure");
        } else {
            tracing::debug!(error = %self, code = %error_code, "Engine rejected request");
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code: error_code.to_string(),
                message: self.user_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => EngineError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => EngineError::Conflict(err.to_string()),
                _ => EngineError::Unavailable(err.to_string()),
            },
            _ => EngineError::Unavailable(err.to_string()),
        }
    }
}

impl From<MoneyError> for EngineError {
    fn from(err: MoneyError) -> Self {
        EngineError::InvalidAmount(err.to_string())
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(err: validator::ValidationErrors) -> Self {
        EngineError::InvalidAmount(err.to_string())
    }
}

/// Result type alias using EngineError
pub type EngineResult<T> = Result<T, EngineError>;

/// Run `op` again while it fails with a transient conflict.
///
/// Every attempt starts a fresh transaction; once `max_attempts` is spent
/// the conflict is reported as `Unavailable`.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(EngineError::Conflict(detail)) => {
                if attempt >= max_attempts {
                    tracing::error!(attempts = attempt, error = %detail, "Transaction conflict retries exhausted");
                    return Err(EngineError::Unavailable(detail));
                }
                tracing::warn!(attempt, error = %detail, "Transaction conflict, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}
