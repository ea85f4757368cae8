//! Postgres Store
//!
//! sqlx-backed implementation of the store contracts. Locks are plain
//! `SELECT ... FOR UPDATE` rows held until the surrounding transaction
//! ends; unique violations and deadlocks are mapped onto the
//! distinguishable [`StoreError`] variants by SQLSTATE.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::model::{
    BalanceSnapshot, NewOutboxEntry, NewUser, OutboxEntry, OutboxStatus, Page, PendingOutbox,
    Transaction, TransactionStatus, TransferDirection, TransferStats, User,
};
use crate::store::{
    LedgerTx, OutboxStore, StoreError, TokenStore, TransactionStore, UserStore,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some("23505") => {
                    return StoreError::Duplicate {
                        constraint: db.constraint().unwrap_or("unknown").to_string(),
                    }
                }
                Some("40001") | Some("40P01") => return StoreError::Deadlock,
                _ => {}
            }
        }
        StoreError::Storage(err.to_string())
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the four tables and their indexes if they do not exist yet.
    /// Runs in a single transaction so a half-bootstrapped schema never
    /// becomes visible.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                balance BIGINT NOT NULL CHECK (balance >= 0),
                initial_balance BIGINT NOT NULL CHECK (initial_balance >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS access_tokens (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id),
                token_digest TEXT NOT NULL UNIQUE,
                revoked_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                uuid UUID PRIMARY KEY,
                sender_id BIGINT NOT NULL REFERENCES users(id),
                receiver_id BIGINT NOT NULL REFERENCES users(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                commission BIGINT NOT NULL CHECK (commission >= 0),
                status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
                idempotency_key TEXT NOT NULL UNIQUE,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK (sender_id <> receiver_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_sender_created
            ON transactions(sender_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_receiver_created
            ON transactions(receiver_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_snapshots (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id),
                balance BIGINT NOT NULL CHECK (balance >= 0),
                transaction_uuid UUID NOT NULL REFERENCES transactions(uuid),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_balance_snapshots_transaction
            ON balance_snapshots(transaction_uuid)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_outbox (
                id BIGSERIAL PRIMARY KEY,
                transaction_uuid UUID NOT NULL REFERENCES transactions(uuid),
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'delivered', 'failed')),
                attempts INT NOT NULL DEFAULT 0,
                last_attempted_at TIMESTAMPTZ,
                delivered_at TIMESTAMPTZ,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transaction_outbox_status_created
            ON transaction_outbox(status, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        balance: row.try_get("balance")?,
        initial_balance: row.try_get("initial_balance")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Transaction {
        uuid: row.try_get("uuid")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        amount: row.try_get("amount")?,
        commission: row.try_get("commission")?,
        status: TransactionStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown transaction status {status:?}")))?,
        idempotency_key: row.try_get("idempotency_key")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEntry, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        transaction_uuid: row.try_get("transaction_uuid")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown outbox status {status:?}")))?,
        attempts: row.try_get("attempts")?,
        last_attempted_at: row.try_get("last_attempted_at")?,
        delivered_at: row.try_get("delivered_at")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

const SELECT_USER: &str =
    "SELECT id, name, email, password_hash, balance, initial_balance, created_at FROM users";

const SELECT_TRANSACTION: &str = "SELECT uuid, sender_id, receiver_id, amount, commission, \
     status, idempotency_key, metadata, created_at FROM transactions";

const SELECT_OUTBOX: &str = "SELECT id, transaction_uuid, event_type, payload, status, attempts, \
     last_attempted_at, delivered_at, error, created_at FROM transaction_outbox";

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (name, email, password_hash, balance, initial_balance)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, email, password_hash, balance, initial_balance, created_at
            "#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.balance)
        .bind(user.initial_balance)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, user_id: i64, digest: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO access_tokens (user_id, token_digest) VALUES ($1, $2)")
            .bind(user_id)
            .bind(digest)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_user_by_token(&self, digest: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.name, u.email, u.password_hash, u.balance, u.initial_balance, u.created_at
            FROM access_tokens t
            JOIN users u ON u.id = t.user_id
            WHERE t.token_digest = $1 AND t.revoked_at IS NULL
            "#,
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn revoke_token(&self, user_id: i64, digest: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE access_tokens SET revoked_at = NOW()
            WHERE user_id = $1 AND token_digest = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<PgLedgerTx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgLedgerTx { tx })
    }

    async fn find_transaction_by_uuid(&self, uuid: Uuid) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_TRANSACTION} WHERE uuid = $1"))
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn list_transactions_for(
        &self,
        user_id: i64,
        direction: TransferDirection,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Transaction>, StoreError> {
        let (filter, count_sql) = match direction {
            TransferDirection::All => (
                "WHERE sender_id = $1 OR receiver_id = $1",
                "SELECT COUNT(*) FROM transactions WHERE sender_id = $1 OR receiver_id = $1",
            ),
            TransferDirection::Sent => (
                "WHERE sender_id = $1",
                "SELECT COUNT(*) FROM transactions WHERE sender_id = $1",
            ),
            TransferDirection::Received => (
                "WHERE receiver_id = $1",
                "SELECT COUNT(*) FROM transactions WHERE receiver_id = $1",
            ),
        };

        let page = page.max(1);
        let offset = (page as i64 - 1) * per_page as i64;

        let rows = sqlx::query(&format!(
            "{SELECT_TRANSACTION} {filter} ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(per_page as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(count_sql)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            page,
            per_page,
            total,
        })
    }

    async fn stats_for(&self, user_id: i64) -> Result<TransferStats, StoreError> {
        let (sent_total, sent_count): (i64, i64) = {
            let row = sqlx::query(
                r#"
                SELECT COALESCE(SUM(amount + commission), 0)::BIGINT AS total, COUNT(*) AS n
                FROM transactions WHERE sender_id = $1 AND status = 'completed'
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            (
                row.try_get("total")?,
                row.try_get("n")?,
            )
        };

        let (received_total, received_count): (i64, i64) = {
            let row = sqlx::query(
                r#"
                SELECT COALESCE(SUM(amount), 0)::BIGINT AS total, COUNT(*) AS n
                FROM transactions WHERE receiver_id = $1 AND status = 'completed'
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            (
                row.try_get("total")?,
                row.try_get("n")?,
            )
        };

        let commission_paid: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(commission), 0)::BIGINT
            FROM transactions WHERE sender_id = $1 AND status = 'completed'
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(TransferStats {
            sent_total_with_commission: sent_total,
            received_total,
            commission_paid,
            sent_count,
            received_count,
        })
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn pending_outbox_batch(&self, limit: u32) -> Result<Vec<PendingOutbox>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, attempts, last_attempted_at, created_at
            FROM transaction_outbox
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingOutbox {
                    id: row.try_get("id")?,
                    attempts: row.try_get("attempts")?,
                    last_attempted_at: row
                        .try_get("last_attempted_at")
                        ?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

/// One open Postgres transaction. Dropping it without commit rolls back.
pub struct PgLedgerTx {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }

    async fn find_transaction_for_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_TRANSACTION} WHERE idempotency_key = $1 FOR UPDATE"
        ))
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn lock_users(&mut self, ids: &[i64]) -> Result<HashMap<i64, User>, StoreError> {
        // One SELECT per id, issued in the caller's (ascending) order, so
        // the lock acquisition order is exactly the canonical order.
        let mut users = HashMap::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(&format!("{SELECT_USER} WHERE id = $1 FOR UPDATE"))
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
            if let Some(row) = row {
                let user = user_from_row(&row)?;
                users.insert(user.id, user);
            }
        }
        Ok(users)
    }

    async fn find_user(&mut self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_user_balance(
        &mut self,
        user_id: i64,
        balance: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET balance = $2 WHERE id = $1")
            .bind(user_id)
            .bind(balance)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (uuid, sender_id, receiver_id, amount, commission, status, idempotency_key, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transaction.uuid)
        .bind(transaction.sender_id)
        .bind(transaction.receiver_id)
        .bind(transaction.amount)
        .bind(transaction.commission)
        .bind(transaction.status.as_str())
        .bind(&transaction.idempotency_key)
        .bind(&transaction.metadata)
        .bind(transaction.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_balance_snapshot(
        &mut self,
        user_id: i64,
        balance: i64,
        transaction_uuid: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO balance_snapshots (user_id, balance, transaction_uuid)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(balance)
        .bind(transaction_uuid)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_outbox_entry(&mut self, entry: NewOutboxEntry) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO transaction_outbox (transaction_uuid, event_type, payload, status, attempts)
            VALUES ($1, $2, $3, 'pending', 0)
            RETURNING id
            "#,
        )
        .bind(entry.transaction_uuid)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn snapshots_for(
        &mut self,
        transaction_uuid: Uuid,
    ) -> Result<Vec<BalanceSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, balance, transaction_uuid, created_at
            FROM balance_snapshots WHERE transaction_uuid = $1
            "#,
        )
        .bind(transaction_uuid)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BalanceSnapshot {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    balance: row.try_get("balance")?,
                    transaction_uuid: row
                        .try_get("transaction_uuid")
                        ?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn claim_outbox_entry(&mut self, id: i64) -> Result<Option<OutboxEntry>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_OUTBOX} WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(outbox_from_row).transpose()
    }

    async fn update_outbox_entry(&mut self, entry: &OutboxEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE transaction_outbox
            SET status = $2, attempts = $3, last_attempted_at = $4, delivered_at = $5, error = $6
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.status.as_str())
        .bind(entry.attempts)
        .bind(entry.last_attempted_at)
        .bind(entry.delivered_at)
        .bind(entry.error.as_deref())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}
