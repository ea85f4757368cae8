//! API Error Mapping
//!
//! The edge never invents business errors: it maps the error kinds of the
//! inner services onto HTTP statuses and a uniform JSON envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use payrail_identity::IdentityError;
use payrail_ledger::store::StoreError;
use payrail_ledger::TransferError;

/// Edge-level error, already shaped for a status code.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Validation {
        message: String,
        errors: Vec<String>,
    },
    Business(String),
    Transient(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Business(_) => StatusCode::BAD_REQUEST,
            ApiError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Unauthorized => serde_json::json!({
                "status": "error",
                "message": "Unauthenticated",
            }),
            ApiError::NotFound(message)
            | ApiError::Business(message)
            | ApiError::Transient(message) => serde_json::json!({
                "status": "error",
                "message": message,
            }),
            ApiError::Validation { message, errors } => serde_json::json!({
                "status": "error",
                "message": message,
                "errors": errors,
            }),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "request failed with internal error");
                serde_json::json!({
                    "status": "error",
                    "message": "internal server error",
                })
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::EmailInUse => ApiError::Validation {
                message: "email is already registered".into(),
                errors: vec!["email is already registered".into()],
            },
            IdentityError::Validation { errors } => ApiError::Validation {
                message: "validation failed".into(),
                errors,
            },
            IdentityError::ReceiverNotFound => {
                ApiError::NotFound("receiver not found".into())
            }
            IdentityError::SelfTransferForbidden => {
                ApiError::Business("you cannot send money to yourself".into())
            }
            IdentityError::Hash(detail) => ApiError::Internal(detail),
            IdentityError::Store(err) => err.into(),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::SelfTransferForbidden
            | TransferError::InvalidAmount
            | TransferError::InvalidIdempotencyKey => ApiError::Business(err.to_string()),
            TransferError::InsufficientBalance { .. } => ApiError::Business(err.to_string()),
            TransferError::UserNotFound(_) => ApiError::NotFound(err.to_string()),
            TransferError::IdempotencyRace
            | TransferError::TransientLockContention(_)
            | TransferError::DeadlineExceeded => ApiError::Transient(err.to_string()),
            TransferError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Deadlock => ApiError::Transient(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
