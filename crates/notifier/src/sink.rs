//! Downstream delivery event sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use herald_common::types::DeliveryEvent;

/// Append-only consumer of delivery events.
///
/// A failing sink never affects delivery; the coordinator logs and moves on.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DeliveryEvent) -> anyhow::Result<()>;
}

/// Writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &DeliveryEvent) -> anyhow::Result<()> {
        tracing::info!(
            request_id = %event.request_id,
            channel = %event.channel,
            state = %event.state,
            attempt = event.attempt_number,
            error_kind = ?event.error_kind,
            retry_after_ms = event.retry_after.map(|d| d.as_millis() as u64),
            "Delivery event"
        );
        Ok(())
    }
}

/// Keeps events in memory, in publish order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }

    /// Events of one request, in publish order.
    pub fn events_for(&self, request_id: Uuid) -> Vec<DeliveryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &DeliveryEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Appends events to a Redis stream with `XADD`.
///
/// Each entry carries the request id, the state and the full event as JSON.
pub struct RedisStreamSink {
    conn: ConnectionManager,
    key: String,
    max_len: usize,
}

impl RedisStreamSink {
    /// Approximate stream length kept by `XADD MAXLEN ~`.
    pub const DEFAULT_MAX_LEN: usize = 100_000;

    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            max_len: Self::DEFAULT_MAX_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }
}

#[async_trait]
impl EventSink for RedisStreamSink {
    async fn publish(&self, event: &DeliveryEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();

        let _entry_id: String = redis::cmd("XADD")
            .arg(&self.key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("request_id")
            .arg(event.request_id.to_string())
            .arg("state")
            .arg(event.state.to_string())
            .arg("event")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
