//! Work-queue abstraction with visibility-timeout semantics.
//!
//! The underlying queue must provide at-least-once delivery, per-message
//! deduplication over a configurable window, redelivery after the
//! visibility timeout expires on unacked items, and a dead-letter target
//! after the redelivery cap (the deployment default is
//! `maxReceiveCount = 3`). The SQS implementation delegates all of that to
//! the broker; the in-memory implementation reproduces it for tests and
//! embedded dev mode.

use async_trait::async_trait;
use nr_common::{ReceivedItem, WorkItem};

pub mod error;
pub mod memory;
pub mod sqs;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// SQS caps a single publish batch at this size.
pub const MAX_PUBLISH_BATCH: usize = 10;

/// Approximate queue depth for health reporting.
#[derive(Debug, Clone, Default)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_flight: u64,
    pub queue_identifier: String,
}

/// Publishes work items onto the queue.
///
/// The dedup id (notification id) and the message group id (recipient) are
/// derived from the item itself, so every publisher applies them uniformly.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    /// Publish one item; returns the broker message id.
    async fn publish(&self, item: &WorkItem) -> Result<String>;

    /// Publish up to [`MAX_PUBLISH_BATCH`] items.
    async fn publish_batch(&self, items: &[WorkItem]) -> Result<Vec<String>>;
}

/// Consumes work items with visibility-timeout semantics.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Long-poll for up to `max_messages` items.
    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedItem>>;

    /// Acknowledge (delete) a delivered item.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Make an item visible again after `delay_seconds`; counted as a
    /// failure in broker metrics.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Same broker operation as `nack` but for non-failure backpressure
    /// (per-recipient rate limiting). Not counted as a failure.
    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.nack(receipt_handle, delay_seconds).await
    }

    /// Push the visibility timeout out for a slow handler.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    fn is_healthy(&self) -> bool;

    async fn stop(&self);

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        Ok(None)
    }
}
