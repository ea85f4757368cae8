//! Payrail Outbox
//!
//! Delivery side of the transactional outbox. The transfer engine
//! co-commits a durable event row with every balance change; the worker in
//! this crate consumes those rows and pushes `money.received` events to the
//! receiver's live channel, at least once, with exponential backoff on
//! transient failure.

pub mod sink;
pub mod worker;

// Re-exports
pub use sink::{HttpPushSink, LogSink, PushError, PushSink, RecordedEvent, RecordingSink};
pub use worker::{
    backoff_for, is_eligible, user_channel, OutboxWorker, WorkerConfig, BACKOFF_SCHEDULE_SECS,
    EVENT_MONEY_RECEIVED, MAX_ATTEMPTS,
};
