//! Route Handlers
//!
//! Thin adapters: authenticate, resolve, delegate, shape the response. No
//! money arithmetic happens here.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use payrail_identity::{IdentityError, Registration};
use payrail_ledger::money;
use payrail_ledger::store::{Store, TransactionStore};
use payrail_ledger::TransferRequest;

use crate::auth::AuthSession;
use crate::dto::{
    CreateTransferRequest, ListQuery, LoginRequest, RegisterRequest, TransactionView, UserView,
    ValidateReceiverRequest,
};
use crate::error::ApiError;
use crate::AppState;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub async fn register<S: Store>(
    State(state): State<AppState<S>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let (user, token) = state
        .identity
        .register(Registration {
            name: body.name,
            email: body.email,
            password: body.password,
            password_confirmation: body.password_confirmation,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "Registration successful",
            "user": UserView::from_user(&user),
            "token": token,
        })),
    )
        .into_response())
}

pub async fn login<S: Store>(
    State(state): State<AppState<S>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    match state.identity.login(&body.email, &body.password).await? {
        Some((user, token)) => Ok(Json(serde_json::json!({
            "message": "Login successful",
            "user": UserView::from_user(&user),
            "token": token,
        }))
        .into_response()),
        // One message for both unknown email and wrong password.
        None => Err(ApiError::Validation {
            message: "Invalid email or password".into(),
            errors: vec![],
        }),
    }
}

pub async fn logout<S: Store>(
    State(state): State<AppState<S>>,
    auth: AuthSession,
) -> Result<Response, ApiError> {
    state.identity.logout(&auth.user, &auth.token).await?;
    Ok(Json(serde_json::json!({ "message": "Logged out" })).into_response())
}

pub async fn current_user<S: Store>(
    State(_state): State<AppState<S>>,
    auth: AuthSession,
) -> Result<Response, ApiError> {
    Ok(Json(serde_json::json!({ "user": UserView::from_user(&auth.user) })).into_response())
}

pub async fn balance<S: Store>(
    State(_state): State<AppState<S>>,
    auth: AuthSession,
) -> Result<Response, ApiError> {
    Ok(Json(serde_json::json!({
        "balance": auth.user.balance,
        "balance_dollars": money::format_dollars(auth.user.balance),
    }))
    .into_response())
}

/// Read-only receiver check the UI calls with debouncing. Leaks nothing
/// beyond the valid flag plus name and email when valid.
pub async fn validate_receiver<S: Store>(
    State(state): State<AppState<S>>,
    auth: AuthSession,
    Json(body): Json<ValidateReceiverRequest>,
) -> Result<Response, ApiError> {
    match state.identity.resolve_receiver(&body.email, &auth.user).await {
        Ok(receiver) => Ok(Json(serde_json::json!({
            "status": "success",
            "data": {
                "valid": true,
                "user": { "name": receiver.name, "email": receiver.email },
            },
        }))
        .into_response()),
        Err(IdentityError::SelfTransferForbidden) => Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "data": { "valid": false, "message": "You cannot send money to yourself" },
            })),
        )
            .into_response()),
        Err(IdentityError::ReceiverNotFound) => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "error",
                "data": { "valid": false, "message": "No user found with this email address" },
            })),
        )
            .into_response()),
        Err(other) => Err(other.into()),
    }
}

pub async fn create_transfer<S: Store>(
    State(state): State<AppState<S>>,
    auth: AuthSession,
    headers: HeaderMap,
    Json(body): Json<CreateTransferRequest>,
) -> Result<Response, ApiError> {
    let receiver = state
        .identity
        .resolve_receiver(&body.receiver_email, &auth.user)
        .await?;

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            money::derive_idempotency_key(
                auth.user.id,
                receiver.id,
                body.amount,
                Utc::now().timestamp(),
            )
        });

    let receipt = state
        .engine
        .transfer(TransferRequest::new(
            auth.user.id,
            receiver.id,
            body.amount,
            idempotency_key,
        ))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "success",
            "message": "Transfer completed",
            "data": {
                "uuid": receipt.transaction.uuid,
                "amount": receipt.transaction.amount,
                "commission": receipt.transaction.commission,
                "total_debited": receipt.transaction.total_debited(),
                "sender_balance": receipt.sender_balance,
                "receiver_balance": receipt.receiver_balance,
                "created_at": receipt.transaction.created_at,
            },
        })),
    )
        .into_response())
}

pub async fn list_transactions<S: Store>(
    State(state): State<AppState<S>>,
    auth: AuthSession,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let page = state
        .store
        .list_transactions_for(
            auth.user.id,
            query.direction(),
            query.page(),
            query.per_page(),
        )
        .await?;

    let last_page = if page.total == 0 {
        1
    } else {
        (page.total + page.per_page as i64 - 1) / page.per_page as i64
    };

    let transactions: Vec<TransactionView> = page
        .items
        .iter()
        .map(TransactionView::from_transaction)
        .collect();

    Ok(Json(serde_json::json!({
        "status": "success",
        "data": {
            "transactions": transactions,
            "pagination": {
                "page": page.page,
                "per_page": page.per_page,
                "total": page.total,
                "last_page": last_page,
            },
        },
    }))
    .into_response())
}

pub async fn get_transaction<S: Store>(
    State(state): State<AppState<S>>,
    auth: AuthSession,
    Path(uuid): Path<Uuid>,
) -> Result<Response, ApiError> {
    let transaction = state
        .store
        .find_transaction_by_uuid(uuid)
        .await?
        // Same 404 whether the row is absent or belongs to strangers, so
        // existence does not leak.
        .filter(|t| t.sender_id == auth.user.id || t.receiver_id == auth.user.id)
        .ok_or_else(|| ApiError::NotFound("transaction not found".into()))?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "data": TransactionView::from_transaction(&transaction),
    }))
    .into_response())
}

pub async fn stats<S: Store>(
    State(state): State<AppState<S>>,
    auth: AuthSession,
) -> Result<Response, ApiError> {
    let stats = state.store.stats_for(auth.user.id).await?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "data": {
            "total_sent": stats.sent_total_with_commission,
            "total_received": stats.received_total,
            "total_commission": stats.commission_paid,
            "total_transactions": stats.sent_count + stats.received_count,
            "net_balance_change": stats.received_total - stats.sent_total_with_commission,
            "sent_count": stats.sent_count,
            "received_count": stats.received_count,
        },
    }))
    .into_response())
}
