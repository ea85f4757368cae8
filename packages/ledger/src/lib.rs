//! Payrail Ledger Core
//!
//! The hard core of the service: integer-cent accounts, the atomic transfer
//! engine, and the transactional outbox that carries `money.transferred`
//! events out of the commit.
//!
//! Features:
//! - Append-only transaction ledger keyed by UUID
//! - Idempotent transfers (caller-supplied or derived keys)
//! - Canonical lock ordering to keep concurrent pairs deadlock-free
//! - Post-transfer balance snapshots for audit
//! - Outbox entries co-committed with every balance change
//!
//! Persistence is behind narrow capability traits ([`store::UserStore`],
//! [`store::TokenStore`], [`store::TransactionStore`], [`store::OutboxStore`])
//! with a Postgres implementation for production and an in-memory
//! implementation for tests.

pub mod engine;
pub mod model;
pub mod money;
pub mod store;

// Re-exports
pub use engine::{TransferEngine, TransferError, TransferReceipt, TransferRequest};
pub use model::{
    BalanceSnapshot, NewOutboxEntry, NewUser, OutboxEntry, OutboxStatus, Page, PendingOutbox,
    Transaction, TransactionStatus, TransferDirection, TransferStats, User,
    EVENT_MONEY_TRANSFERRED,
};
pub use store::memory::MemStore;
pub use store::postgres::PgStore;
pub use store::{LedgerTx, OutboxStore, Store, StoreError, TokenStore, TransactionStore, UserStore};
