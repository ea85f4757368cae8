//! Ledger Entities
//!
//! All money quantities are non-negative integers in minor units (cents).
//! Every row carries a creation timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type written by the transfer engine into the outbox.
pub const EVENT_MONEY_TRANSFERRED: &str = "money.transferred";

/// An account holder.
///
/// `balance` is mutated only by the transfer engine under a row lock;
/// `initial_balance` is frozen at creation and exists so audits can verify
/// conservation across the whole ledger.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub balance: i64,
    pub initial_balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub balance: i64,
    pub initial_balance: i64,
}

/// Ledger entry status.
///
/// The engine only ever writes `Completed`; `Failed` exists for seeded or
/// historical rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// An immutable ledger entry. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub uuid: Uuid,
    pub sender_id: i64,
    pub receiver_id: i64,
    /// Amount credited to the receiver, minor units.
    pub amount: i64,
    /// Fee charged to the sender on top of `amount`.
    pub commission: i64,
    pub status: TransactionStatus,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// What left the sender's balance: `amount + commission`.
    pub fn total_debited(&self) -> i64 {
        self.amount + self.commission
    }
}

/// Post-transfer audit record. Exactly two are written per committed
/// transfer, one per side, inside the same atomic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub id: i64,
    pub user_id: i64,
    /// The user's balance after the transfer committed.
    pub balance: i64,
    pub transaction_uuid: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Outbox entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "delivered" => Some(OutboxStatus::Delivered),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Delivered | OutboxStatus::Failed)
    }
}

/// A durable event record, co-committed with the transfer that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub transaction_uuid: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new outbox entry. Entries always start `pending`
/// with zero attempts.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub transaction_uuid: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Scheduling view of a pending outbox entry, enough for the worker to
/// decide backoff eligibility without loading the payload.
#[derive(Debug, Clone)]
pub struct PendingOutbox {
    pub id: i64,
    pub attempts: i32,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// History filter relative to one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    All,
    Sent,
    Received,
}

impl Default for TransferDirection {
    fn default() -> Self {
        TransferDirection::All
    }
}

/// One page of a descending-by-creation listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

/// Per-user aggregates over completed transfers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferStats {
    /// Sum of `amount + commission` over transfers the user sent.
    pub sent_total_with_commission: i64,
    /// Sum of `amount` over transfers the user received.
    pub received_total: i64,
    /// Sum of `commission` over transfers the user sent.
    pub commission_paid: i64,
    pub sent_count: i64,
    pub received_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_debited() {
        let txn = Transaction {
            uuid: Uuid::new_v4(),
            sender_id: 1,
            receiver_id: 2,
            amount: 10_000,
            commission: 150,
            status: TransactionStatus::Completed,
            idempotency_key: "k1".into(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert_eq!(txn.total_debited(), 10_150);
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            TransactionStatus::parse("completed"),
            Some(TransactionStatus::Completed)
        );
        assert_eq!(OutboxStatus::parse(OutboxStatus::Processing.as_str()), Some(OutboxStatus::Processing));
        assert_eq!(OutboxStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_outbox_states() {
        assert!(OutboxStatus::Delivered.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());
    }
}
