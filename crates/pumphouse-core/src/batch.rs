//! Size-bounded Event Batches
//!
//! A link advertises the largest message it accepts. `EventDataBatch` tracks the
//! cumulative size of the events added to it against that limit so a send never
//! fails for being too big.
//!
//! ## Size Accounting
//!
//! ```text
//! batch size = BATCH_OVERHEAD_BYTES + Σ EventData::size_bytes()
//! ```
//!
//! - `try_add` returns `Ok(true)` when the event was added
//! - `try_add` returns `Ok(false)` when the batch is full; send it and start a new one
//! - `try_add` returns `Err(EventTooLarge)` when the event would not fit even into an
//!   empty batch

use crate::error::{Error, Result};
use crate::event::EventData;

/// Default message size limit used when a link does not advertise one (1 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Fixed envelope overhead of a batch.
pub const BATCH_OVERHEAD_BYTES: usize = 64;

#[derive(Debug, Clone)]
pub struct EventDataBatch {
    max_size_bytes: usize,
    size_bytes: usize,
    partition_id: Option<String>,
    events: Vec<EventData>,
}

impl EventDataBatch {
    /// Create an empty batch bounded by `max_size_bytes`.
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            max_size_bytes,
            size_bytes: BATCH_OVERHEAD_BYTES,
            partition_id: None,
            events: Vec::new(),
        }
    }

    /// Pin the batch to a partition.
    pub fn for_partition(mut self, partition_id: impl Into<String>) -> Self {
        self.partition_id = Some(partition_id.into());
        self
    }

    /// Try to add an event, respecting the size limit.
    pub fn try_add(&mut self, event: EventData) -> Result<bool> {
        let event_size = event.size_bytes();

        if BATCH_OVERHEAD_BYTES + event_size > self.max_size_bytes {
            return Err(Error::EventTooLarge {
                size: event_size,
                max: self.max_size_bytes.saturating_sub(BATCH_OVERHEAD_BYTES),
            });
        }

        if self.size_bytes + event_size > self.max_size_bytes {
            return Ok(false);
        }

        self.size_bytes += event_size;
        self.events.push(event);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn partition_id(&self) -> Option<&str> {
        self.partition_id.as_deref()
    }

    pub fn events(&self) -> &[EventData] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EventData> {
        self.events
    }
}
