use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    #[error("invalid queue region: {0}")]
    Layout(&'static str),

    #[error("failed to map queue region")]
    Map(#[from] std::io::Error),

    #[error("a producer is already attached to this queue")]
    ProducerAttached,

    #[error("end of stream needs at least one consumer")]
    NoConsumers,

    #[error("consumer {consumer} gave up on sequence {seq} after {retries} retries")]
    Timeout {
        consumer: usize,
        seq: i64,
        retries: u32,
    },

    #[error("region lock not acquired within {0:?}")]
    LockUnavailable(Duration),

    #[error("wait cancelled")]
    Cancelled,
}

impl QueueError {
    /// Only a dequeue timeout leaves the queue usable; the caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueueError::Timeout { .. })
    }
}
