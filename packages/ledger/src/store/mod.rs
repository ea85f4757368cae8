//! Store Contracts
//!
//! Narrow capability traits over the relational store. The transfer engine
//! and the outbox worker depend on these seams, never on a concrete
//! backend, so tests can substitute the in-memory implementation.
//!
//! Transactional work goes through [`LedgerTx`]: a handle obtained from
//! [`TransactionStore::begin`] that holds row locks until `commit` or
//! `rollback`. Dropping a handle without committing rolls back.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    BalanceSnapshot, NewOutboxEntry, NewUser, OutboxEntry, Page, PendingOutbox, Transaction,
    TransferDirection, TransferStats, User,
};

pub mod memory;
pub mod postgres;

/// Storage failures, shaped so callers can tell retryable contention from
/// constraint violations and everything else.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate key on {constraint}")]
    Duplicate { constraint: String },

    /// Deadlock or serialization failure; safe to retry the whole unit.
    #[error("deadlock detected")]
    Deadlock,

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Deadlock)
    }
}

/// User rows: creation and lookups outside any transaction.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
}

/// Bearer-token rows. Only digests are ever stored.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, user_id: i64, digest: &str) -> Result<(), StoreError>;

    /// Resolves the owning user of a live, non-revoked token digest.
    async fn find_user_by_token(&self, digest: &str) -> Result<Option<User>, StoreError>;

    /// Revokes one specific token. Returns whether a live row was revoked.
    async fn revoke_token(&self, user_id: i64, digest: &str) -> Result<bool, StoreError>;
}

/// Ledger reads plus the entry point into atomic units of work.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    type Tx: LedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn find_transaction_by_uuid(&self, uuid: Uuid) -> Result<Option<Transaction>, StoreError>;

    /// Rows ordered by `created_at` descending.
    async fn list_transactions_for(
        &self,
        user_id: i64,
        direction: TransferDirection,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Transaction>, StoreError>;

    async fn stats_for(&self, user_id: i64) -> Result<TransferStats, StoreError>;
}

/// Scheduling reads for the outbox worker.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest `pending` entries first. Backoff eligibility is the worker's
    /// concern; this just returns candidates in creation order.
    async fn pending_outbox_batch(&self, limit: u32) -> Result<Vec<PendingOutbox>, StoreError>;
}

/// An open atomic unit of work holding its row locks until it ends.
#[async_trait]
pub trait LedgerTx: Send {
    async fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    async fn rollback(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Idempotency lookup with a row lock, so two concurrent retries with
    /// the same key collapse here instead of racing to the unique index.
    async fn find_transaction_for_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Loads and exclusively locks the given user rows. `ids` must already
    /// be sorted ascending: every caller locking the same pair in the same
    /// order is what keeps opposite-direction transfers deadlock-free.
    /// Missing ids are simply absent from the result.
    async fn lock_users(&mut self, ids: &[i64]) -> Result<HashMap<i64, User>, StoreError>;

    /// Plain in-transaction read, no lock taken.
    async fn find_user(&mut self, id: i64) -> Result<Option<User>, StoreError>;

    async fn update_user_balance(&mut self, user_id: i64, balance: i64)
        -> Result<(), StoreError>;

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn insert_balance_snapshot(
        &mut self,
        user_id: i64,
        balance: i64,
        transaction_uuid: Uuid,
    ) -> Result<(), StoreError>;

    async fn insert_outbox_entry(&mut self, entry: NewOutboxEntry) -> Result<i64, StoreError>;

    async fn snapshots_for(
        &mut self,
        transaction_uuid: Uuid,
    ) -> Result<Vec<BalanceSnapshot>, StoreError>;

    /// Loads one outbox entry with a row lock so concurrent workers cannot
    /// deliver it twice.
    async fn claim_outbox_entry(&mut self, id: i64) -> Result<Option<OutboxEntry>, StoreError>;

    async fn update_outbox_entry(&mut self, entry: &OutboxEntry) -> Result<(), StoreError>;
}

/// Umbrella bound for components that need the whole store surface.
pub trait Store: UserStore + TokenStore + TransactionStore + OutboxStore + 'static {}

impl<T> Store for T where T: UserStore + TokenStore + TransactionStore + OutboxStore + 'static {}
