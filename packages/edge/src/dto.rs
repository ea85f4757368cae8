//! Wire Shapes
//!
//! Request and response bodies. All monetary fields are integer minor
//! units; `balance_dollars` is a formatted display string, never a float.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use payrail_ledger::model::{Transaction, TransferDirection, User};
use payrail_ledger::money;

/// Listings default to a modest page and are clamped here.
pub const DEFAULT_PER_PAGE: u32 = 15;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateReceiverRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub receiver_email: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub direction: Option<TransferDirection>,
}

impl ListQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction.unwrap_or_default()
    }
}

/// Public view of a user. Never carries the password hash.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub balance: i64,
    pub balance_dollars: String,
}

impl UserView {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            balance: user.balance,
            balance_dollars: money::format_dollars(user.balance),
        }
    }
}

/// Ledger row as listed and fetched.
#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub uuid: Uuid,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub amount: i64,
    pub commission: i64,
    pub total_debited: i64,
    pub status: payrail_ledger::model::TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl TransactionView {
    pub fn from_transaction(transaction: &Transaction) -> Self {
        Self {
            uuid: transaction.uuid,
            sender_id: transaction.sender_id,
            receiver_id: transaction.receiver_id,
            amount: transaction.amount,
            commission: transaction.commission,
            total_debited: transaction.total_debited(),
            status: transaction.status,
            created_at: transaction.created_at,
        }
    }
}
