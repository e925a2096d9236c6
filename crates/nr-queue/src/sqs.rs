//! AWS SQS queue adapter.

use async_trait::async_trait;
use aws_sdk_sqs::types::{
    MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

use nr_common::{ReceivedItem, WorkItem};

use crate::{QueueConsumer, QueueDepth, QueueError, QueuePublisher, Result, MAX_PUBLISH_BATCH};

/// SQS publisher: dedup id = notification id, group id = recipient.
pub struct SqsQueuePublisher {
    client: Client,
    queue_url: String,
    queue_name: String,
}

impl SqsQueuePublisher {
    pub fn new(client: Client, queue_url: String) -> Self {
        let queue_name = queue_name_of(&queue_url);
        Self {
            client,
            queue_url,
            queue_name,
        }
    }
}

fn queue_name_of(queue_url: &str) -> String {
    queue_url
        .split('/')
        .next_back()
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl QueuePublisher for SqsQueuePublisher {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, item: &WorkItem) -> Result<String> {
        let body = serde_json::to_string(item)?;

        let result = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_group_id(item.group_id())
            .message_deduplication_id(item.dedup_id())
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let message_id = result.message_id().unwrap_or_default().to_string();
        debug!(
            notification_id = %item.notification_id,
            broker_message_id = %message_id,
            queue = %self.queue_name,
            "Work item published"
        );
        Ok(message_id)
    }

    async fn publish_batch(&self, items: &[WorkItem]) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if items.len() > MAX_PUBLISH_BATCH {
            return Err(QueueError::Sqs(format!(
                "batch of {} exceeds SQS limit of {}",
                items.len(),
                MAX_PUBLISH_BATCH
            )));
        }

        let mut entries = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let entry = SendMessageBatchRequestEntry::builder()
                .id(i.to_string())
                .message_body(serde_json::to_string(item)?)
                .message_group_id(item.group_id())
                .message_deduplication_id(item.dedup_id())
                .build()
                .map_err(|e| QueueError::Sqs(e.to_string()))?;
            entries.push(entry);
        }

        let result = self
            .client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        if !result.failed().is_empty() {
            return Err(QueueError::Sqs(format!(
                "{} of {} batch entries failed",
                result.failed().len(),
                items.len()
            )));
        }

        Ok(result
            .successful()
            .iter()
            .map(|e| e.message_id().to_string())
            .collect())
    }
}

/// SQS consumer with long polling and visibility-timeout control.
pub struct SqsQueueConsumer {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
}

impl SqsQueueConsumer {
    /// Long-poll wait. SQS max is 20 seconds; the worker uses the max so an
    /// idle fleet costs one API call per consumer per 20 s.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 20;

    pub fn new(client: Client, queue_url: String, visibility_timeout_seconds: i32) -> Self {
        let queue_name = queue_name_of(&queue_url);
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
        }
    }

    /// Shorter waits respond to shutdown faster at the cost of more polls.
    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    fn parse_message(
        &self,
        msg: &aws_sdk_sqs::types::Message,
    ) -> Result<(WorkItem, String, Option<String>)> {
        let body = msg
            .body()
            .ok_or_else(|| QueueError::Sqs("message body is empty".to_string()))?;

        let item: WorkItem = serde_json::from_str(body)?;

        let receipt_handle = msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Sqs("missing receipt handle".to_string()))?
            .to_string();

        Ok((item, receipt_handle, msg.message_id().map(String::from)))
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedItem>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut items = Vec::with_capacity(sqs_messages.len());

        for msg in sqs_messages {
            match self.parse_message(&msg) {
                Ok((item, receipt_handle, broker_message_id)) => items.push(ReceivedItem {
                    item,
                    receipt_handle,
                    broker_message_id,
                    queue_identifier: self.queue_name.clone(),
                }),
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "Malformed work item");
                    // Ack it: a body that never parses would redeliver forever.
                    if let Some(handle) = msg.receipt_handle() {
                        let _ = self.ack(handle).await;
                    }
                }
            }
        }

        if !items.is_empty() {
            self.total_polled
                .fetch_add(items.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.queue_name, count = items.len(), "Polled work items");
        }

        Ok(items)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        // SQS has no explicit nack: shrink the visibility timeout instead.
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.unwrap_or(0) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(
            queue = %self.queue_name,
            seconds = seconds,
            "Visibility extended"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS consumer stopped");
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let attributes = result.attributes();
        let get = |name: &QueueAttributeName| {
            attributes
                .and_then(|attrs| attrs.get(name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Ok(Some(QueueDepth {
            pending: get(&QueueAttributeName::ApproximateNumberOfMessages),
            in_flight: get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
            queue_identifier: self.queue_name.clone(),
        }))
    }
}
