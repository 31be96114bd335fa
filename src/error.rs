use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::processor::ProcessorError;

/// Service-level error taxonomy shared by every component
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed input. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Duplicate account, duplicate active subscription, duplicate
    /// transaction. Callers often treat this as idempotent success.
    #[error("{0}")]
    Conflict(ConflictKind),

    /// Processor API call failed
    #[error("payment processor error: {0}")]
    ExternalService(#[from] ProcessorError),

    #[error("webhook signature verification failed")]
    Signature,

    /// Downstream dispatch failed after verification
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("a connected account already exists for tenant {0}")]
    AccountAlreadyExists(String),

    #[error("tenant {0} cannot accept charges yet")]
    AccountNotChargeable(String),

    #[error("an active subscription already exists for payer {payer_id} on tenant {tenant_id}")]
    DuplicateActiveSubscription { tenant_id: String, payer_id: String },

    #[error("transaction {0} has already been recorded")]
    DuplicateTransaction(String),

    #[error("revenue split for tenant {0} was changed concurrently")]
    ConcurrentSplitChange(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Conflict(_) | AppError::Signature => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ExternalService(_) | AppError::Processing(_) | AppError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(kind) => match kind {
                ConflictKind::AccountAlreadyExists(_) => "account_already_exists",
                ConflictKind::AccountNotChargeable(_) => "account_not_chargeable",
                ConflictKind::DuplicateActiveSubscription { .. } => {
                    "duplicate_active_subscription"
                }
                ConflictKind::DuplicateTransaction(_) => "duplicate_transaction",
                ConflictKind::ConcurrentSplitChange(_) => "conflict",
            },
            AppError::ExternalService(_) => "external_service_error",
            AppError::Signature => "signature_error",
            AppError::Processing(_) => "processing_error",
            AppError::Database(_) => "database_error",
        }
    }

    pub fn is_duplicate_transaction(&self) -> bool {
        matches!(
            self,
            AppError::Conflict(ConflictKind::DuplicateTransaction(_))
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "Internal database error".to_string()
            }
            AppError::ExternalService(e) => {
                tracing::error!(error = %e, "payment processor call failed");
                "Payment processor request failed".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorResponse::new(self.error_code(), message))).into_response()
    }
}

/// True when a sqlx error is a unique-constraint violation
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}
