mod backoff;
mod consumer;
mod error;
mod layout;
mod producer;
mod queue;
mod region;
mod ring;
mod sync;

pub use backoff::{Backoff, BackoffState, Doorbell};
pub use consumer::{Consumer, ConsumerStats, Delivery};
pub use error::QueueError;
pub use layout::{EMPTY, QueueStatus, bytes_for_queue};
pub use producer::{Enqueued, Producer};
pub use queue::FfQueue;
pub use ring::{QueueConfig, SyncOptions, SyncStrategy, seq_to_index};

pub use ffq_events::Sentinel;
