//! The dispatch pipeline: queue consumer pool, message processor, retry
//! sweeper and schedule promoter.
//!
//! The [`Processor`] owns every send-driven state transition; the sweepers
//! re-inject due work by direct invocation so retry timing does not depend
//! on queue redelivery. Queue wrapping (ack/nack/defer mapping, visibility
//! extension) is entirely the worker pool's concern.

use thiserror::Error;

pub mod pool;
pub mod processor;
pub mod sweeper;

pub use pool::{WorkerPool, WorkerPoolConfig};
pub use processor::{ProcessOutcome, Processor, ProcessorConfig, Sender};
pub use sweeper::{RateLimitJanitor, RetrySweeper, SchedulePromoter};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] nr_store::StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] nr_queue::QueueError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
