//! Atomic Transfer Engine
//!
//! The one write path for balances. A transfer validates its inputs,
//! replays on a known idempotency key, locks both user rows in canonical
//! ascending order, moves the money, and co-commits the ledger row, both
//! balance snapshots, and the outbox entry as a single unit of work.
//! Deadlocks are absorbed by a bounded retry loop; everything else is
//! surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{
    NewOutboxEntry, Transaction, TransactionStatus, EVENT_MONEY_TRANSFERRED,
};
use crate::money;
use crate::store::{LedgerTx, StoreError, TransactionStore};

/// Transfer request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub sender_id: i64,
    pub receiver_id: i64,
    /// Amount credited to the receiver, minor units. Commission comes on top.
    pub amount: i64,
    /// Collapses repeated attempts of the same logical transfer.
    pub idempotency_key: String,
    /// Opaque metadata persisted with the ledger row.
    pub metadata: serde_json::Value,
    /// Optional deadline; past it the in-flight unit rolls back.
    pub deadline: Option<Instant>,
}

impl TransferRequest {
    pub fn new(
        sender_id: i64,
        receiver_id: i64,
        amount: i64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            amount,
            idempotency_key: idempotency_key.into(),
            metadata: serde_json::json!({}),
            deadline: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn validate(&self) -> Result<(), TransferError> {
        if self.sender_id == self.receiver_id {
            return Err(TransferError::SelfTransferForbidden);
        }
        if self.amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if self.idempotency_key.is_empty() {
            return Err(TransferError::InvalidIdempotencyKey);
        }
        Ok(())
    }
}

/// The committed result handed back to the caller.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub transaction: Transaction,
    /// Sender's balance after the transfer committed.
    pub sender_balance: i64,
    /// Receiver's balance after the transfer committed.
    pub receiver_balance: i64,
    /// True when an existing row was returned for the idempotency key.
    pub replayed: bool,
}

/// Transfer errors.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("sender and receiver must differ")]
    SelfTransferForbidden,

    #[error("amount must be a positive number of minor units")]
    InvalidAmount,

    #[error("idempotency key must not be empty")]
    InvalidIdempotencyKey,

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// A concurrent attempt with the same key slipped past the locked
    /// lookup on another connection. Deadlock-retry class.
    #[error("concurrent transfer with the same idempotency key")]
    IdempotencyRace,

    #[error("could not complete transfer after {0} attempts under lock contention")]
    TransientLockContention(u32),

    #[error("deadline exceeded before commit")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::IdempotencyRace | TransferError::Store(StoreError::Deadlock)
        )
    }
}

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// The transfer engine. Cheap to clone; all instances share the store.
pub struct TransferEngine<S> {
    store: Arc<S>,
    wake: Option<Arc<Notify>>,
    max_attempts: u32,
    retry_base: Duration,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            wake: self.wake.clone(),
            max_attempts: self.max_attempts,
            retry_base: self.retry_base,
        }
    }
}

impl<S: TransactionStore> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            wake: None,
            max_attempts: MAX_ATTEMPTS,
            retry_base: RETRY_BASE,
        }
    }

    /// Wakes the outbox worker after each fresh commit. A lost wakeup is
    /// harmless: the worker's poll tick picks the entry up.
    pub fn with_outbox_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Execute a transfer and return the committed ledger view.
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt, TransferError> {
        request.validate()?;

        let receipt = match request.deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(TransferError::DeadlineExceeded);
                }
                // Cancelling the in-flight future drops the open store
                // transaction, which rolls it back.
                tokio::time::timeout_at(deadline, self.transfer_with_retries(&request))
                    .await
                    .map_err(|_| TransferError::DeadlineExceeded)??
            }
            None => self.transfer_with_retries(&request).await?,
        };

        if !receipt.replayed {
            if let Some(wake) = &self.wake {
                wake.notify_one();
            }
        }
        Ok(receipt)
    }

    async fn transfer_with_retries(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(request).await {
                Ok(receipt) => return Ok(receipt),
                Err(err) if err.is_retryable() => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            sender_id = request.sender_id,
                            receiver_id = request.receiver_id,
                            attempts = attempt,
                            "transfer gave up under lock contention"
                        );
                        return Err(TransferError::TransientLockContention(attempt));
                    }
                    tracing::debug!(
                        sender_id = request.sender_id,
                        receiver_id = request.receiver_id,
                        attempt,
                        error = %err,
                        "transfer retrying after contention"
                    );
                    tokio::time::sleep(self.retry_base * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let mut tx = self.store.begin().await?;

        // Locked lookup: two concurrent retries with the same key collapse
        // here instead of both reaching the insert.
        if let Some(existing) = tx.find_transaction_for_key(&request.idempotency_key).await? {
            let snapshots = tx.snapshots_for(existing.uuid).await?;
            tx.commit().await?;

            let balance_of = |user_id: i64| {
                snapshots
                    .iter()
                    .find(|s| s.user_id == user_id)
                    .map(|s| s.balance)
                    .unwrap_or_default()
            };
            tracing::debug!(
                transaction_uuid = %existing.uuid,
                idempotency_key = %request.idempotency_key,
                "idempotent replay, returning original transaction"
            );
            return Ok(TransferReceipt {
                sender_balance: balance_of(existing.sender_id),
                receiver_balance: balance_of(existing.receiver_id),
                transaction: existing,
                replayed: true,
            });
        }

        // Canonical lock order: ascending ids, always, so opposite-direction
        // transfers over the same pair cannot ABBA-deadlock.
        let mut lock_set = [request.sender_id, request.receiver_id];
        lock_set.sort_unstable();
        let mut locked = tx.lock_users(&lock_set).await?;

        let Some(mut sender) = locked.remove(&request.sender_id) else {
            tx.rollback().await?;
            return Err(TransferError::UserNotFound(request.sender_id));
        };
        let Some(mut receiver) = locked.remove(&request.receiver_id) else {
            tx.rollback().await?;
            return Err(TransferError::UserNotFound(request.receiver_id));
        };

        let commission = money::commission(request.amount);
        let debited = money::total_debited(request.amount);
        if sender.balance < debited {
            let available = sender.balance;
            tx.rollback().await?;
            return Err(TransferError::InsufficientBalance {
                required: debited,
                available,
            });
        }

        sender.balance -= debited;
        receiver.balance += request.amount;
        tx.update_user_balance(sender.id, sender.balance).await?;
        tx.update_user_balance(receiver.id, receiver.balance).await?;

        let transaction = Transaction {
            uuid: Uuid::new_v4(),
            sender_id: sender.id,
            receiver_id: receiver.id,
            amount: request.amount,
            commission,
            status: TransactionStatus::Completed,
            idempotency_key: request.idempotency_key.clone(),
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
        };
        match tx.insert_transaction(&transaction).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                tx.rollback().await?;
                return Err(TransferError::IdempotencyRace);
            }
            Err(other) => return Err(other.into()),
        }

        tx.insert_balance_snapshot(sender.id, sender.balance, transaction.uuid)
            .await?;
        tx.insert_balance_snapshot(receiver.id, receiver.balance, transaction.uuid)
            .await?;

        tx.insert_outbox_entry(NewOutboxEntry {
            transaction_uuid: transaction.uuid,
            event_type: EVENT_MONEY_TRANSFERRED.to_string(),
            payload: serde_json::json!({
                "transaction_uuid": transaction.uuid,
                "sender_id": sender.id,
                "receiver_id": receiver.id,
                "amount": request.amount,
                "commission": commission,
                "sender_balance": sender.balance,
                "receiver_balance": receiver.balance,
            }),
        })
        .await?;

        tx.commit().await?;

        tracing::info!(
            transaction_uuid = %transaction.uuid,
            sender_id = sender.id,
            receiver_id = receiver.id,
            amount = request.amount,
            commission,
            "transfer committed"
        );

        Ok(TransferReceipt {
            transaction,
            sender_balance: sender.balance,
            receiver_balance: receiver.balance,
            replayed: false,
        })
    }
}
