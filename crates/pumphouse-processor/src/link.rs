//! Event Link - Transport Abstraction
//!
//! The processor never talks to a broker directly. It reads partitions through an
//! `EventLink`, which opens one `EventReceiver` per partition pump.
//!
//! ## Contract
//!
//! - `open(partition, position)` returns a receiver positioned at `position`
//! - a receiver yields events in partition order and is not restartable; to resume
//!   elsewhere, close it and open a new one
//! - `next_event()` returns `None` once the receiver has ended, and
//!   `Some(Err(_))` when the broker ends it with an error
//! - `close()` releases broker resources; dropping an unclosed receiver must
//!   release them too
//!
//! ## Cancel Safety
//!
//! Pumps race `next_event()` against their stop signal in `tokio::select!`.
//! `next_event()` must be cancel-safe: dropping the future before it resolves
//! must not lose an event.
//!
//! ## Sending
//!
//! `create_batch()` returns an `EventDataBatch` bounded by the link's
//! `max_message_size()`. Fill it with `try_add` and publish it with `send_batch`.

use async_trait::async_trait;
use pumphouse_core::{
    EventDataBatch, EventPosition, ReceivedEvent, Result, DEFAULT_MAX_MESSAGE_SIZE,
};

/// Connection to one event stream.
#[async_trait]
pub trait EventLink: Send + Sync {
    /// Name of the stream this link reads.
    fn stream_name(&self) -> &str;

    /// Current partition ids of the stream.
    async fn partition_ids(&self) -> Result<Vec<String>>;

    /// Open a receiver on one partition.
    async fn open(
        &self,
        partition_id: &str,
        position: EventPosition,
    ) -> Result<Box<dyn EventReceiver>>;

    /// Largest message (batch) the link accepts, in bytes.
    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    /// Empty batch sized for this link.
    fn create_batch(&self) -> EventDataBatch {
        EventDataBatch::new(self.max_message_size())
    }

    /// Publish a batch to a partition.
    async fn send_batch(&self, partition_id: &str, batch: EventDataBatch) -> Result<()>;
}

/// Lazy, unbounded sequence of events from one partition.
#[async_trait]
pub trait EventReceiver: Send {
    /// Wait for the next event. Must be cancel-safe.
    async fn next_event(&mut self) -> Option<Result<ReceivedEvent>>;

    /// Release broker resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}
