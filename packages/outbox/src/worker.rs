//! Outbox Delivery Worker
//!
//! Long-running consumer of the transactional outbox. Wakes on the
//! engine's post-commit signal or on a poll tick, claims the oldest
//! eligible pending entry under a row lock, publishes the `money.received`
//! event, and records the outcome. Transient push failures back off
//! exponentially; malformed payloads and exhausted budgets are terminal.
//!
//! Any number of workers may run against the same store: the row-lock
//! claim means an entry is delivered by exactly one of them per attempt,
//! and delivery stays at-least-once overall.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use payrail_ledger::model::{OutboxEntry, OutboxStatus, PendingOutbox};
use payrail_ledger::money;
use payrail_ledger::store::{LedgerTx, OutboxStore, StoreError, TransactionStore};

use crate::sink::PushSink;

/// Event name emitted to the receiver's channel.
pub const EVENT_MONEY_RECEIVED: &str = "money.received";

/// Retry schedule in seconds, indexed by how many attempts have failed.
pub const BACKOFF_SCHEDULE_SECS: [i64; 5] = [10, 20, 40, 80, 160];

/// Attempts after which an entry is terminally failed.
pub const MAX_ATTEMPTS: i32 = 5;

/// Per-receiver push channel name.
pub fn user_channel(user_id: i64) -> String {
    format!("user.{user_id}")
}

/// Backoff to wait after `attempts` failed attempts.
pub fn backoff_for(attempts: i32) -> chrono::Duration {
    let idx = (attempts.max(1) as usize - 1).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    chrono::Duration::seconds(BACKOFF_SCHEDULE_SECS[idx])
}

/// Whether a pending entry is due for another attempt.
pub fn is_eligible(entry: &PendingOutbox, now: DateTime<Utc>) -> bool {
    match entry.last_attempted_at {
        None => true,
        Some(last) => last + backoff_for(entry.attempts) <= now,
    }
}

/// The payload the engine co-commits with every transfer. Deserializing it
/// is the worker's validation step: a missing field is a permanent defect
/// of the entry, never retried.
#[derive(Debug, Deserialize)]
struct TransferEventPayload {
    transaction_uuid: Uuid,
    sender_id: i64,
    receiver_id: i64,
    amount: i64,
    commission: i64,
    #[allow(dead_code)]
    sender_balance: i64,
    receiver_balance: i64,
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on how long a lost wakeup can delay delivery.
    pub poll_interval: Duration,
    /// Per-attempt publish timeout.
    pub publish_timeout: Duration,
    /// How many pending candidates to scan per pass.
    pub batch_size: u32,
    pub max_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(30),
            batch_size: 32,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

/// The outbox delivery worker.
pub struct OutboxWorker<S> {
    store: Arc<S>,
    sink: Arc<dyn PushSink>,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    config: WorkerConfig,
}

impl<S> OutboxWorker<S>
where
    S: TransactionStore + OutboxStore + 'static,
{
    pub fn new(store: Arc<S>, sink: Arc<dyn PushSink>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            sink,
            wake: Arc::new(Notify::new()),
            shutdown,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Shared wakeup handle; hand this to the transfer engine.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run until shutdown. Finishes the in-flight entry before exiting.
    pub async fn run(mut self) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "outbox worker started"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.process_available().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(delivered_or_settled = n, "outbox pass complete"),
                Err(err) => tracing::error!(error = %err, "outbox pass failed"),
            }
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        tracing::info!("outbox worker stopped");
    }

    /// Process every currently-eligible pending entry. Returns how many
    /// entries reached a new state this pass.
    pub async fn process_available(&self) -> Result<u32, StoreError> {
        let mut settled = 0;
        loop {
            if *self.shutdown.borrow() {
                return Ok(settled);
            }
            match self.process_next().await? {
                true => settled += 1,
                false => return Ok(settled),
            }
        }
    }

    /// Claim and handle the oldest eligible pending entry. Returns false
    /// when there is nothing eligible to do.
    async fn process_next(&self) -> Result<bool, StoreError> {
        let batch = self.store.pending_outbox_batch(self.config.batch_size).await?;
        let now = Utc::now();
        let Some(candidate) = batch.iter().find(|e| is_eligible(e, now)) else {
            return Ok(false);
        };

        let mut tx = self.store.begin().await?;
        let Some(mut entry) = tx.claim_outbox_entry(candidate.id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        if entry.status != OutboxStatus::Pending {
            // Another worker claimed it between the scan and the lock.
            tx.rollback().await?;
            return Ok(true);
        }

        entry.status = OutboxStatus::Processing;
        tx.update_outbox_entry(&entry).await?;

        let payload: TransferEventPayload =
            match serde_json::from_value(entry.payload.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    return self
                        .settle_invalid(tx, entry, format!("invalid payload: {err}"))
                        .await
                        .map(|_| true);
                }
            };

        let Some(sender) = tx.find_user(payload.sender_id).await? else {
            return self
                .settle_invalid(
                    tx,
                    entry,
                    format!("sender {} does not exist", payload.sender_id),
                )
                .await
                .map(|_| true);
        };

        let event = serde_json::json!({
            "transaction_uuid": payload.transaction_uuid,
            "amount": payload.amount,
            "new_balance": payload.receiver_balance,
            "sender": {
                "id": sender.id,
                "name": sender.name,
                "email": sender.email,
            },
            "receiver_id": payload.receiver_id,
            "message": format!(
                "You received ${} from {}",
                money::format_dollars(payload.amount),
                sender.name
            ),
            "timestamp": Utc::now().to_rfc3339(),
        });
        let channel = user_channel(payload.receiver_id);

        let outcome = tokio::time::timeout(
            self.config.publish_timeout,
            self.sink.publish(&channel, EVENT_MONEY_RECEIVED, &event),
        )
        .await;

        let now = Utc::now();
        match outcome {
            Ok(Ok(())) => {
                entry.status = OutboxStatus::Delivered;
                entry.delivered_at = Some(now);
                entry.last_attempted_at = Some(now);
                entry.error = None;
                tx.update_outbox_entry(&entry).await?;
                tx.commit().await?;
                tracing::info!(
                    entry_id = entry.id,
                    transaction_uuid = %entry.transaction_uuid,
                    channel = %channel,
                    "outbox entry delivered"
                );
            }
            Ok(Err(push_err)) => {
                self.settle_transient(tx, entry, push_err.to_string(), now)
                    .await?;
            }
            Err(_elapsed) => {
                self.settle_transient(
                    tx,
                    entry,
                    format!(
                        "publish timed out after {}s",
                        self.config.publish_timeout.as_secs()
                    ),
                    now,
                )
                .await?;
            }
        }
        Ok(true)
    }

    /// Terminal failure: the entry can never succeed, record why.
    async fn settle_invalid(
        &self,
        mut tx: S::Tx,
        mut entry: OutboxEntry,
        error: String,
    ) -> Result<(), StoreError> {
        tracing::error!(
            entry_id = entry.id,
            transaction_uuid = %entry.transaction_uuid,
            error = %error,
            "outbox entry is malformed, marking failed"
        );
        entry.status = OutboxStatus::Failed;
        entry.last_attempted_at = Some(Utc::now());
        entry.error = Some(error);
        tx.update_outbox_entry(&entry).await?;
        tx.commit().await
    }

    /// Transient failure: count the attempt and either keep the entry
    /// pending for backoff or fail it once the budget is spent.
    async fn settle_transient(
        &self,
        mut tx: S::Tx,
        mut entry: OutboxEntry,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        entry.attempts += 1;
        entry.last_attempted_at = Some(now);
        entry.error = Some(error.clone());
        if entry.attempts >= self.config.max_attempts {
            entry.status = OutboxStatus::Failed;
            tracing::error!(
                entry_id = entry.id,
                transaction_uuid = %entry.transaction_uuid,
                attempts = entry.attempts,
                error = %error,
                "outbox entry exhausted its attempt budget"
            );
        } else {
            entry.status = OutboxStatus::Pending;
            tracing::warn!(
                entry_id = entry.id,
                transaction_uuid = %entry.transaction_uuid,
                attempts = entry.attempts,
                retry_in_secs = backoff_for(entry.attempts).num_seconds(),
                error = %error,
                "outbox delivery failed, will retry"
            );
        }
        tx.update_outbox_entry(&entry).await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use payrail_ledger::model::{NewOutboxEntry, NewUser};
    use payrail_ledger::store::memory::MemStore;
    use payrail_ledger::store::UserStore;
    use payrail_ledger::{TransferEngine, TransferRequest};

    async fn seed_user(store: &MemStore, name: &str, email: &str, balance: i64) -> i64 {
        store
            .insert_user(NewUser {
                name: name.into(),
                email: email.into(),
                password_hash: "hash".into(),
                balance,
                initial_balance: balance,
            })
            .await
            .unwrap()
            .id
    }

    fn worker(
        store: Arc<MemStore>,
        sink: Arc<RecordingSink>,
    ) -> (OutboxWorker<MemStore>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = OutboxWorker::new(store, sink, shutdown_rx);
        (worker, shutdown_tx)
    }

    async fn transfer(store: &Arc<MemStore>, sender: i64, receiver: i64, amount: i64, key: &str) {
        TransferEngine::new(store.clone())
            .transfer(TransferRequest::new(sender, receiver, amount, key))
            .await
            .unwrap();
    }

    /// Rewind the entry's last attempt so the backoff window has elapsed.
    async fn rewind_backoff(store: &Arc<MemStore>, entry_id: i64) {
        let mut tx = store.begin().await.unwrap();
        let mut entry = tx.claim_outbox_entry(entry_id).await.unwrap().unwrap();
        entry.last_attempted_at = entry
            .last_attempted_at
            .map(|t| t - chrono::Duration::seconds(600));
        tx.update_outbox_entry(&entry).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_delivers_transfer_event() {
        let store = Arc::new(MemStore::new());
        let alice = seed_user(&store, "Alice", "alice@example.com", 100_000).await;
        let bob = seed_user(&store, "Bob", "bob@example.com", 50_000).await;
        transfer(&store, alice, bob, 10_000, "k1").await;

        let sink = Arc::new(RecordingSink::new());
        let (worker, _shutdown) = worker(store.clone(), sink.clone());

        assert_eq!(worker.process_available().await.unwrap(), 1);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, format!("user.{bob}"));
        assert_eq!(events[0].event, EVENT_MONEY_RECEIVED);
        assert_eq!(events[0].payload["amount"], 10_000);
        assert_eq!(events[0].payload["new_balance"], 60_000);
        assert_eq!(events[0].payload["sender"]["name"], "Alice");
        assert_eq!(events[0].payload["receiver_id"], bob);
        assert_eq!(
            events[0].payload["message"],
            "You received $100.00 from Alice"
        );

        let (_, _, _, outbox) = store.dump().await;
        assert_eq!(outbox[0].status, OutboxStatus::Delivered);
        assert!(outbox[0].delivered_at.is_some());
        assert!(outbox[0].error.is_none());
    }

    #[tokio::test]
    async fn test_nothing_pending_is_a_quiet_pass() {
        let store = Arc::new(MemStore::new());
        let sink = Arc::new(RecordingSink::new());
        let (worker, _shutdown) = worker(store, sink);
        assert_eq!(worker.process_available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_terminal() {
        let store = Arc::new(MemStore::new());
        let mut tx = store.begin().await.unwrap();
        tx.insert_outbox_entry(NewOutboxEntry {
            transaction_uuid: Uuid::new_v4(),
            event_type: "money.transferred".into(),
            payload: serde_json::json!({ "amount": 10 }),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let sink = Arc::new(RecordingSink::new());
        let (worker, _shutdown) = worker(store.clone(), sink.clone());
        assert_eq!(worker.process_available().await.unwrap(), 1);

        let (_, _, _, outbox) = store.dump().await;
        assert_eq!(outbox[0].status, OutboxStatus::Failed);
        assert!(outbox[0].error.as_deref().unwrap().contains("invalid payload"));
        assert!(sink.events().is_empty());

        // Terminal: another pass must not touch it.
        assert_eq!(worker.process_available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_recovers() {
        let store = Arc::new(MemStore::new());
        let alice = seed_user(&store, "Alice", "alice@example.com", 100_000).await;
        let bob = seed_user(&store, "Bob", "bob@example.com", 0).await;
        transfer(&store, alice, bob, 333, "k1").await;

        let sink = Arc::new(RecordingSink::failing(1));
        let (worker, _shutdown) = worker(store.clone(), sink.clone());

        assert_eq!(worker.process_available().await.unwrap(), 1);
        let (_, _, _, outbox) = store.dump().await;
        assert_eq!(outbox[0].status, OutboxStatus::Pending);
        assert_eq!(outbox[0].attempts, 1);
        assert!(outbox[0].error.is_some());

        // Inside the backoff window nothing is eligible.
        assert_eq!(worker.process_available().await.unwrap(), 0);

        rewind_backoff(&store, outbox[0].id).await;
        assert_eq!(worker.process_available().await.unwrap(), 1);

        let (_, _, _, outbox) = store.dump().await;
        assert_eq!(outbox[0].status, OutboxStatus::Delivered);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_is_terminal() {
        let store = Arc::new(MemStore::new());
        let alice = seed_user(&store, "Alice", "alice@example.com", 100_000).await;
        let bob = seed_user(&store, "Bob", "bob@example.com", 0).await;
        transfer(&store, alice, bob, 333, "k1").await;

        let sink = Arc::new(RecordingSink::failing(100));
        let (worker, _shutdown) = worker(store.clone(), sink.clone());

        for attempt in 1..=MAX_ATTEMPTS {
            assert_eq!(worker.process_available().await.unwrap(), 1);
            let (_, _, _, outbox) = store.dump().await;
            assert_eq!(outbox[0].attempts, attempt);
            if attempt < MAX_ATTEMPTS {
                assert_eq!(outbox[0].status, OutboxStatus::Pending);
                rewind_backoff(&store, outbox[0].id).await;
            }
        }

        let (_, _, _, outbox) = store.dump().await;
        assert_eq!(outbox[0].status, OutboxStatus::Failed);
        assert!(sink.events().is_empty());

        assert_eq!(worker.process_available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backoff_schedule() {
        assert_eq!(backoff_for(1).num_seconds(), 10);
        assert_eq!(backoff_for(2).num_seconds(), 20);
        assert_eq!(backoff_for(3).num_seconds(), 40);
        assert_eq!(backoff_for(4).num_seconds(), 80);
        assert_eq!(backoff_for(5).num_seconds(), 160);
        // Past the schedule it stays at the cap.
        assert_eq!(backoff_for(9).num_seconds(), 160);
    }

    #[tokio::test]
    async fn test_eligibility_respects_backoff_window() {
        let now = Utc::now();
        let fresh = PendingOutbox {
            id: 1,
            attempts: 0,
            last_attempted_at: None,
            created_at: now,
        };
        assert!(is_eligible(&fresh, now));

        let just_failed = PendingOutbox {
            id: 2,
            attempts: 1,
            last_attempted_at: Some(now),
            created_at: now,
        };
        assert!(!is_eligible(&just_failed, now));
        assert!(is_eligible(&just_failed, now + chrono::Duration::seconds(10)));
    }

    #[tokio::test]
    async fn test_wakeup_drives_delivery_without_polling() {
        let store = Arc::new(MemStore::new());
        let alice = seed_user(&store, "Alice", "alice@example.com", 100_000).await;
        let bob = seed_user(&store, "Bob", "bob@example.com", 0).await;

        let sink = Arc::new(RecordingSink::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Poll far in the future so only the wakeup can drive the pass.
        let worker = OutboxWorker::new(store.clone(), sink.clone(), shutdown_rx)
            .with_poll_interval(Duration::from_secs(3600));
        let wake = worker.wake_handle();
        let handle = tokio::spawn(worker.run());

        let engine = TransferEngine::new(store.clone()).with_outbox_wake(wake);
        engine
            .transfer(TransferRequest::new(alice, bob, 1_000, "k1"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !sink.events().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("wakeup must drive delivery");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker must exit on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_while_idle() {
        let store = Arc::new(MemStore::new());
        let sink = Arc::new(RecordingSink::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = OutboxWorker::new(store, sink, shutdown_rx);
        let handle = tokio::spawn(worker.run());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker must exit promptly")
            .unwrap();
    }
}
