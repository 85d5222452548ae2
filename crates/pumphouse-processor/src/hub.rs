//! In-Memory Event Hub
//!
//! `MemoryEventHub` is an `EventLink` backed by per-partition logs held in memory.
//! It is what the test suite and local experiments run against.
//!
//! ## Positions
//!
//! - sequence numbers start at 0 in every partition
//! - offsets are byte positions in the partition log, rendered as strings
//! - enqueued time is stamped on send (milliseconds since epoch)
//!
//! ## Fault Injection
//!
//! - `set_unavailable(true)`: `partition_ids`, `open` and `send_batch` fail with `Transport`
//! - `inject_error(partition, err)`: the next receiver read on that partition ends with `err`
//! - `remove_partition(partition)`: open receivers end with `PartitionNotFound`
//!
//! ## Example
//!
//! ```ignore
//! let hub = MemoryEventHub::new("orders", ["0", "1"]);
//! hub.publish("0", vec![EventData::new("hello")]).await?;
//!
//! let mut receiver = hub.open("0", EventPosition::Earliest).await?;
//! let event = receiver.next_event().await.unwrap()?;
//! assert_eq!(event.sequence_number, 0);
//! ```

use crate::link::{EventLink, EventReceiver};
use async_trait::async_trait;
use pumphouse_core::{
    Error, EventData, EventDataBatch, EventPosition, ReceivedEvent, Result,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use pumphouse_core::event::EVENT_OVERHEAD_BYTES;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct PartitionLog {
    events: Vec<ReceivedEvent>,
    next_sequence: i64,
    next_offset: u64,
    pending_error: Option<Error>,
}

impl PartitionLog {
    /// Index of the first event at or after `position`.
    fn start_index(&self, position: &EventPosition) -> Result<usize> {
        let index = match position {
            EventPosition::Earliest => 0,
            EventPosition::Latest => self.events.len(),
            EventPosition::Offset { offset, inclusive } => {
                let target: u64 = offset
                    .parse()
                    .map_err(|_| Error::InvalidPosition(format!("offset '{}'", offset)))?;
                self.events
                    .iter()
                    .position(|e| {
                        let at = e.offset.parse::<u64>().unwrap_or(u64::MAX);
                        if *inclusive {
                            at >= target
                        } else {
                            at > target
                        }
                    })
                    .unwrap_or(self.events.len())
            }
            EventPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => self
                .events
                .iter()
                .position(|e| {
                    if *inclusive {
                        e.sequence_number >= *sequence_number
                    } else {
                        e.sequence_number > *sequence_number
                    }
                })
                .unwrap_or(self.events.len()),
            EventPosition::EnqueuedTime { enqueued_time } => self
                .events
                .iter()
                .position(|e| e.enqueued_time > *enqueued_time)
                .unwrap_or(self.events.len()),
        };
        Ok(index)
    }

    fn append(&mut self, data: EventData) -> ReceivedEvent {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        let offset = self.next_offset;
        self.next_offset += data.size_bytes() as u64;

        let event = ReceivedEvent::from_event_data(
            data,
            offset.to_string(),
            sequence_number,
            chrono::Utc::now().timestamp_millis(),
        );
        self.events.push(event.clone());
        event
    }

    /// Store an event with caller-chosen positions; later sends continue after it.
    fn append_positioned(&mut self, event: ReceivedEvent) {
        self.next_sequence = self.next_sequence.max(event.sequence_number + 1);
        if let Ok(offset) = event.offset.parse::<u64>() {
            let end = offset + (event.body.len() + EVENT_OVERHEAD_BYTES) as u64;
            self.next_offset = self.next_offset.max(end);
        }
        self.events.push(event);
    }
}

struct HubInner {
    partitions: RwLock<BTreeMap<String, PartitionLog>>,
    changed: Notify,
    unavailable: AtomicBool,
    open_receivers: AtomicUsize,
    receivers_opened: AtomicU64,
}

/// In-memory `EventLink`.
#[derive(Clone)]
pub struct MemoryEventHub {
    stream_name: String,
    max_message_size: usize,
    inner: Arc<HubInner>,
}

impl MemoryEventHub {
    pub fn new<I, S>(stream_name: impl Into<String>, partition_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let partitions = partition_ids
            .into_iter()
            .map(|id| (id.into(), PartitionLog::default()))
            .collect();

        Self {
            stream_name: stream_name.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inner: Arc::new(HubInner {
                partitions: RwLock::new(partitions),
                changed: Notify::new(),
                unavailable: AtomicBool::new(false),
                open_receivers: AtomicUsize::new(0),
                receivers_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Override the advertised message size limit.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Publish events to a partition, splitting them into link-sized batches.
    ///
    /// Returns the sequence numbers assigned to the events.
    pub async fn publish(
        &self,
        partition_id: &str,
        events: impl IntoIterator<Item = EventData>,
    ) -> Result<Vec<i64>> {
        let first = self.next_sequence(partition_id).await?;
        let mut batch = self.create_batch().for_partition(partition_id);

        for event in events {
            if !batch.try_add(event.clone())? {
                let full = std::mem::replace(
                    &mut batch,
                    self.create_batch().for_partition(partition_id),
                );
                self.send_batch(partition_id, full).await?;
                batch.try_add(event)?;
            }
        }
        if !batch.is_empty() {
            self.send_batch(partition_id, batch).await?;
        }

        let last = self.next_sequence(partition_id).await?;
        Ok((first..last).collect())
    }

    /// Append an already-positioned event verbatim.
    ///
    /// Lets tests reproduce broker positions exactly (for example offsets that are
    /// not byte positions). Events sent afterwards get sequence numbers and offsets
    /// past the appended one.
    pub async fn append_received(&self, partition_id: &str, event: ReceivedEvent) -> Result<()> {
        {
            let mut partitions = self.inner.partitions.write().await;
            let log = partitions
                .get_mut(partition_id)
                .ok_or_else(|| Error::PartitionNotFound(partition_id.to_string()))?;
            log.append_positioned(event);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    pub async fn add_partition(&self, partition_id: impl Into<String>) {
        self.inner
            .partitions
            .write()
            .await
            .entry(partition_id.into())
            .or_default();
        self.inner.changed.notify_waiters();
    }

    /// Delete a partition. Open receivers on it end with `PartitionNotFound`.
    pub async fn remove_partition(&self, partition_id: &str) {
        self.inner.partitions.write().await.remove(partition_id);
        self.inner.changed.notify_waiters();
    }

    /// End the next read on `partition_id` with `error`.
    pub async fn inject_error(&self, partition_id: &str, error: Error) {
        if let Some(log) = self.inner.partitions.write().await.get_mut(partition_id) {
            log.pending_error = Some(error);
        }
        self.inner.changed.notify_waiters();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Receivers currently open (not closed and not dropped).
    pub fn open_receivers(&self) -> usize {
        self.inner.open_receivers.load(Ordering::SeqCst)
    }

    /// Receivers ever opened on this hub.
    pub fn receivers_opened(&self) -> u64 {
        self.inner.receivers_opened.load(Ordering::SeqCst)
    }

    async fn next_sequence(&self, partition_id: &str) -> Result<i64> {
        self.inner
            .partitions
            .read()
            .await
            .get(partition_id)
            .map(|log| log.next_sequence)
            .ok_or_else(|| Error::PartitionNotFound(partition_id.to_string()))
    }

    pub async fn partition_len(&self, partition_id: &str) -> Result<usize> {
        self.inner
            .partitions
            .read()
            .await
            .get(partition_id)
            .map(|log| log.events.len())
            .ok_or_else(|| Error::PartitionNotFound(partition_id.to_string()))
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "event hub '{}' unavailable",
                self.stream_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLink for MemoryEventHub {
    fn stream_name(&self) -> &str {
        &self.stream_name
    }

    async fn partition_ids(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.inner.partitions.read().await.keys().cloned().collect())
    }

    async fn open(
        &self,
        partition_id: &str,
        position: EventPosition,
    ) -> Result<Box<dyn EventReceiver>> {
        self.check_available()?;

        let next_index = {
            let partitions = self.inner.partitions.read().await;
            let log = partitions
                .get(partition_id)
                .ok_or_else(|| Error::PartitionNotFound(partition_id.to_string()))?;
            log.start_index(&position)?
        };

        self.inner.open_receivers.fetch_add(1, Ordering::SeqCst);
        self.inner.receivers_opened.fetch_add(1, Ordering::SeqCst);

        debug!(
            stream = %self.stream_name,
            partition_id = %partition_id,
            position = %position,
            next_index = next_index,
            "Opened memory receiver"
        );

        Ok(Box::new(MemoryReceiver {
            inner: Arc::clone(&self.inner),
            partition_id: partition_id.to_string(),
            next_index,
            closed: false,
        }))
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send_batch(&self, partition_id: &str, batch: EventDataBatch) -> Result<()> {
        self.check_available()?;

        if batch.size_bytes() > self.max_message_size {
            return Err(Error::EventTooLarge {
                size: batch.size_bytes(),
                max: self.max_message_size,
            });
        }

        {
            let mut partitions = self.inner.partitions.write().await;
            let log = partitions
                .get_mut(partition_id)
                .ok_or_else(|| Error::PartitionNotFound(partition_id.to_string()))?;
            for event in batch.into_events() {
                log.append(event);
            }
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

struct MemoryReceiver {
    inner: Arc<HubInner>,
    partition_id: String,
    next_index: usize,
    closed: bool,
}

impl MemoryReceiver {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.open_receivers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EventReceiver for MemoryReceiver {
    async fn next_event(&mut self) -> Option<Result<ReceivedEvent>> {
        loop {
            if self.closed {
                return None;
            }

            // Register interest before looking, so a send between the check and
            // the await still wakes us.
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut partitions = self.inner.partitions.write().await;
                let Some(log) = partitions.get_mut(&self.partition_id) else {
                    return Some(Err(Error::PartitionNotFound(self.partition_id.clone())));
                };
                if let Some(error) = log.pending_error.take() {
                    return Some(Err(error));
                }
                if let Some(event) = log.events.get(self.next_index) {
                    self.next_index += 1;
                    return Some(Ok(event.clone()));
                }
            }

            changed.await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        self.release();
    }
}
