use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("receipt handle not found: {0}")]
    UnknownReceipt(String),

    #[error("queue is stopped")]
    Stopped,

    #[error("AWS SQS error: {0}")]
    Sqs(String),
}
