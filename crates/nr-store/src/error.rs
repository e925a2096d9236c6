use nr_common::DeliveryStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("notification not found: {0}")]
    NotFound(Uuid),

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
