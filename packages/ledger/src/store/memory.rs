//! In-Memory Store
//!
//! Test substitute for the Postgres backend: the whole dataset lives
//! behind one async mutex, and a "transaction" owns the guard for its
//! entire lifetime. That serializes units of work, which is exactly the
//! semantics the engine's tests need; a transaction snapshots the state on
//! `begin` and restores it on rollback (or on drop, matching the
//! drop-rolls-back contract of the SQL backend).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::model::{
    BalanceSnapshot, NewOutboxEntry, NewUser, OutboxEntry, OutboxStatus, Page, PendingOutbox,
    Transaction, TransferDirection, TransferStats, User,
};
use crate::store::{
    LedgerTx, OutboxStore, StoreError, TokenStore, TransactionStore, UserStore,
};

#[derive(Debug, Clone)]
struct TokenRow {
    user_id: i64,
    digest: String,
    revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    users: HashMap<i64, User>,
    tokens: Vec<TokenRow>,
    transactions: Vec<Transaction>,
    snapshots: Vec<BalanceSnapshot>,
    outbox: Vec<OutboxEntry>,
    next_user_id: i64,
    next_snapshot_id: i64,
    next_outbox_id: i64,
}

/// In-memory store for tests and local development.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test seeding: overwrite a user's balance and initial balance in one
    /// step so the conservation invariant stays intact.
    pub async fn seed_balance(&self, user_id: i64, balance: i64) {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.balance = balance;
            user.initial_balance = balance;
        }
    }

    /// Test inspection: cloned copies of every table.
    pub async fn dump(
        &self,
    ) -> (
        Vec<User>,
        Vec<Transaction>,
        Vec<BalanceSnapshot>,
        Vec<OutboxEntry>,
    ) {
        let state = self.state.lock().await;
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        (
            users,
            state.transactions.clone(),
            state.snapshots.clone(),
            state.outbox.clone(),
        )
    }
}

#[async_trait]
impl UserStore for MemStore {
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Duplicate {
                constraint: "users_email_key".into(),
            });
        }
        state.next_user_id += 1;
        let row = User {
            id: state.next_user_id,
            name: user.name,
            email: user.email,
            password_hash: user.password_hash,
            balance: user.balance,
            initial_balance: user.initial_balance,
            created_at: Utc::now(),
        };
        state.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.users.get(&id).cloned())
    }
}

#[async_trait]
impl TokenStore for MemStore {
    async fn insert_token(&self, user_id: i64, digest: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.tokens.iter().any(|t| t.digest == digest) {
            return Err(StoreError::Duplicate {
                constraint: "access_tokens_token_digest_key".into(),
            });
        }
        state.tokens.push(TokenRow {
            user_id,
            digest: digest.to_string(),
            revoked_at: None,
        });
        Ok(())
    }

    async fn find_user_by_token(&self, digest: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().await;
        let user_id = state
            .tokens
            .iter()
            .find(|t| t.digest == digest && t.revoked_at.is_none())
            .map(|t| t.user_id);
        Ok(user_id.and_then(|id| state.users.get(&id).cloned()))
    }

    async fn revoke_token(&self, user_id: i64, digest: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        for token in state.tokens.iter_mut() {
            if token.user_id == user_id && token.digest == digest && token.revoked_at.is_none() {
                token.revoked_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl TransactionStore for MemStore {
    type Tx = MemLedgerTx;

    async fn begin(&self) -> Result<MemLedgerTx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let undo = guard.clone();
        Ok(MemLedgerTx {
            guard,
            undo,
            finished: false,
        })
    }

    async fn find_transaction_by_uuid(&self, uuid: Uuid) -> Result<Option<Transaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.transactions.iter().find(|t| t.uuid == uuid).cloned())
    }

    async fn list_transactions_for(
        &self,
        user_id: i64,
        direction: TransferDirection,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Transaction>, StoreError> {
        let state = self.state.lock().await;
        let matches = |t: &&Transaction| match direction {
            TransferDirection::All => t.sender_id == user_id || t.receiver_id == user_id,
            TransferDirection::Sent => t.sender_id == user_id,
            TransferDirection::Received => t.receiver_id == user_id,
        };
        let page = page.max(1);
        // Insertion order is chronological, so newest-first is a reverse walk.
        let filtered: Vec<Transaction> = state
            .transactions
            .iter()
            .rev()
            .filter(matches)
            .cloned()
            .collect();
        let total = filtered.len() as i64;
        let items = filtered
            .into_iter()
            .skip(((page - 1) * per_page) as usize)
            .take(per_page as usize)
            .collect();
        Ok(Page {
            items,
            page,
            per_page,
            total,
        })
    }

    async fn stats_for(&self, user_id: i64) -> Result<TransferStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = TransferStats::default();
        for t in state
            .transactions
            .iter()
            .filter(|t| t.status == crate::model::TransactionStatus::Completed)
        {
            if t.sender_id == user_id {
                stats.sent_total_with_commission += t.amount + t.commission;
                stats.commission_paid += t.commission;
                stats.sent_count += 1;
            }
            if t.receiver_id == user_id {
                stats.received_total += t.amount;
                stats.received_count += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl OutboxStore for MemStore {
    async fn pending_outbox_batch(&self, limit: u32) -> Result<Vec<PendingOutbox>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .take(limit as usize)
            .map(|e| PendingOutbox {
                id: e.id,
                attempts: e.attempts,
                last_attempted_at: e.last_attempted_at,
                created_at: e.created_at,
            })
            .collect())
    }
}

/// One open in-memory unit of work. Owns the dataset guard, so every other
/// store call waits until this finishes: serializable by construction.
pub struct MemLedgerTx {
    guard: OwnedMutexGuard<MemState>,
    undo: MemState,
    finished: bool,
}

impl Drop for MemLedgerTx {
    fn drop(&mut self) {
        if !self.finished {
            *self.guard = std::mem::take(&mut self.undo);
        }
    }
}

#[async_trait]
impl LedgerTx for MemLedgerTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        *self.guard = std::mem::take(&mut self.undo);
        Ok(())
    }

    async fn find_transaction_for_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self
            .guard
            .transactions
            .iter()
            .find(|t| t.idempotency_key == key)
            .cloned())
    }

    async fn lock_users(&mut self, ids: &[i64]) -> Result<HashMap<i64, User>, StoreError> {
        let mut users = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.guard.users.get(id) {
                users.insert(*id, user.clone());
            }
        }
        Ok(users)
    }

    async fn find_user(&mut self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.guard.users.get(&id).cloned())
    }

    async fn update_user_balance(
        &mut self,
        user_id: i64,
        balance: i64,
    ) -> Result<(), StoreError> {
        match self.guard.users.get_mut(&user_id) {
            Some(user) => {
                user.balance = balance;
                Ok(())
            }
            None => Err(StoreError::Storage(format!("user {user_id} not found"))),
        }
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        if self
            .guard
            .transactions
            .iter()
            .any(|t| t.idempotency_key == transaction.idempotency_key)
        {
            return Err(StoreError::Duplicate {
                constraint: "transactions_idempotency_key_key".into(),
            });
        }
        if self.guard.transactions.iter().any(|t| t.uuid == transaction.uuid) {
            return Err(StoreError::Duplicate {
                constraint: "transactions_pkey".into(),
            });
        }
        self.guard.transactions.push(transaction.clone());
        Ok(())
    }

    async fn insert_balance_snapshot(
        &mut self,
        user_id: i64,
        balance: i64,
        transaction_uuid: Uuid,
    ) -> Result<(), StoreError> {
        self.guard.next_snapshot_id += 1;
        let id = self.guard.next_snapshot_id;
        self.guard.snapshots.push(BalanceSnapshot {
            id,
            user_id,
            balance,
            transaction_uuid,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_outbox_entry(&mut self, entry: NewOutboxEntry) -> Result<i64, StoreError> {
        self.guard.next_outbox_id += 1;
        let id = self.guard.next_outbox_id;
        self.guard.outbox.push(OutboxEntry {
            id,
            transaction_uuid: entry.transaction_uuid,
            event_type: entry.event_type,
            payload: entry.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_attempted_at: None,
            delivered_at: None,
            error: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn snapshots_for(
        &mut self,
        transaction_uuid: Uuid,
    ) -> Result<Vec<BalanceSnapshot>, StoreError> {
        Ok(self
            .guard
            .snapshots
            .iter()
            .filter(|s| s.transaction_uuid == transaction_uuid)
            .cloned()
            .collect())
    }

    async fn claim_outbox_entry(&mut self, id: i64) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(self.guard.outbox.iter().find(|e| e.id == id).cloned())
    }

    async fn update_outbox_entry(&mut self, entry: &OutboxEntry) -> Result<(), StoreError> {
        match self.guard.outbox.iter_mut().find(|e| e.id == entry.id) {
            Some(row) => {
                *row = entry.clone();
                Ok(())
            }
            None => Err(StoreError::Storage(format!(
                "outbox entry {} not found",
                entry.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str, email: &str) -> NewUser {
        NewUser {
            name: name.into(),
            email: email.into(),
            password_hash: "hash".into(),
            balance: 0,
            initial_balance: 0,
        }
    }

    #[tokio::test]
    async fn test_insert_user_assigns_ids() {
        let store = MemStore::new();
        let a = store.insert_user(new_user("Alice", "a@example.com")).await.unwrap();
        let b = store.insert_user(new_user("Bob", "b@example.com")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = MemStore::new();
        store.insert_user(new_user("Alice", "a@example.com")).await.unwrap();
        let err = store
            .insert_user(new_user("Alice Again", "a@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let store = MemStore::new();
        let user = store.insert_user(new_user("Alice", "a@example.com")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_user_balance(user.id, 5_000).await.unwrap();
        tx.rollback().await.unwrap();

        let reloaded = store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.balance, 0);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let store = MemStore::new();
        let user = store.insert_user(new_user("Alice", "a@example.com")).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.update_user_balance(user.id, 5_000).await.unwrap();
            // dropped here
        }

        let reloaded = store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.balance, 0);
    }

    #[tokio::test]
    async fn test_commit_keeps_changes() {
        let store = MemStore::new();
        let user = store.insert_user(new_user("Alice", "a@example.com")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_user_balance(user.id, 5_000).await.unwrap();
        tx.commit().await.unwrap();

        let reloaded = store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.balance, 5_000);
    }

    #[tokio::test]
    async fn test_token_revocation_is_per_token() {
        let store = MemStore::new();
        let user = store.insert_user(new_user("Alice", "a@example.com")).await.unwrap();
        store.insert_token(user.id, "digest-1").await.unwrap();
        store.insert_token(user.id, "digest-2").await.unwrap();

        assert!(store.revoke_token(user.id, "digest-1").await.unwrap());
        assert!(store.find_user_by_token("digest-1").await.unwrap().is_none());
        assert!(store.find_user_by_token("digest-2").await.unwrap().is_some());
    }
}
