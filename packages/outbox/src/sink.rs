//! Push Sink Contract
//!
//! The real-time delivery fabric is external; the worker only needs a
//! `publish(channel, event, payload)` capability. The HTTP implementation
//! posts to a hosted pub/sub endpoint; the log sink is the no-network
//! fallback; the recording sink backs tests.

use async_trait::async_trait;
use serde_json::Value;

/// Push delivery errors. Everything here is transient from the worker's
/// point of view: it retries with backoff until the attempt budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Network(String),

    #[error("push sink rejected event with status {0}")]
    Rejected(u16),
}

impl From<reqwest::Error> for PushError {
    fn from(err: reqwest::Error) -> Self {
        PushError::Network(err.to_string())
    }
}

/// The black-box publish capability.
#[async_trait]
pub trait PushSink: Send + Sync + 'static {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<(), PushError>;
}

/// Publishes events to a hosted pub/sub service over HTTP.
pub struct HttpPushSink {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
}

impl HttpPushSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

#[async_trait]
impl PushSink for HttpPushSink {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<(), PushError> {
        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({
            "channel": channel,
            "name": event,
            "data": payload,
        }));
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PushError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Logs events instead of delivering them. Used when no sink is configured,
/// so local development still shows what would have gone out.
pub struct LogSink;

#[async_trait]
impl PushSink for LogSink {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<(), PushError> {
        tracing::info!(channel, event, %payload, "push event (log sink)");
        Ok(())
    }
}

/// A captured publish call.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

/// Test sink: records every publish and can be told to fail the first N
/// attempts to exercise the worker's retry path.
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<RecordedEvent>>,
    failures_remaining: std::sync::atomic::AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls before starting to succeed.
    pub fn failing(n: u32) -> Self {
        let sink = Self::default();
        sink.failures_remaining
            .store(n, std::sync::atomic::Ordering::SeqCst);
        sink
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl PushSink for RecordingSink {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<(), PushError> {
        let remaining = self
            .failures_remaining
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        if remaining {
            return Err(PushError::Network("injected failure".into()));
        }
        self.events.lock().push(RecordedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_sink_captures_events() {
        let sink = RecordingSink::new();
        sink.publish("user.7", "money.received", &serde_json::json!({"amount": 5}))
            .await
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, "user.7");
        assert_eq!(events[0].payload["amount"], 5);
    }

    #[tokio::test]
    async fn test_failing_sink_recovers_after_budget() {
        let sink = RecordingSink::failing(2);
        assert!(sink.publish("c", "e", &serde_json::json!({})).await.is_err());
        assert!(sink.publish("c", "e", &serde_json::json!({})).await.is_err());
        assert!(sink.publish("c", "e", &serde_json::json!({})).await.is_ok());
        assert_eq!(sink.events().len(), 1);
    }
}
