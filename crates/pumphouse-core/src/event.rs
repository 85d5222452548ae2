//! Event Data Structures
//!
//! Two shapes of the same thing:
//!
//! - `EventData` is what a producer hands to a link. It has no position yet.
//! - `ReceivedEvent` is what a receiver yields. The broker has stamped it with an
//!   offset, a sequence number and an enqueued time.
//!
//! ## Positions
//! - **offset**: opaque broker cursor, kept as a string (brokers are free to encode it)
//! - **sequence_number**: dense, strictly increasing per partition; this is the value
//!   checkpoints are ordered by
//! - **enqueued_time**: milliseconds since epoch when the broker accepted the event

use crate::position::Checkpoint;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed per-event overhead counted by batch size accounting (headers, framing).
pub const EVENT_OVERHEAD_BYTES: usize = 24;

/// An event to be published to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventData {
    /// Event payload
    pub body: Bytes,

    /// Optional key used by the broker to pick a partition
    pub partition_key: Option<String>,

    /// Application properties
    pub properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            partition_key: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Size of this event as counted against a link's message size limit.
    pub fn size_bytes(&self) -> usize {
        let key_size = self.partition_key.as_ref().map_or(0, |k| k.len());
        let property_size: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.body.len() + key_size + property_size + EVENT_OVERHEAD_BYTES
    }
}

/// An event read from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    /// Broker offset of this event
    pub offset: String,

    /// Sequence number of this event within its partition
    pub sequence_number: i64,

    /// Enqueued time in milliseconds since epoch
    pub enqueued_time: i64,

    /// Partition key the event was published with, if any
    pub partition_key: Option<String>,

    /// Event payload
    pub body: Bytes,

    /// Application properties
    pub properties: HashMap<String, String>,
}

impl ReceivedEvent {
    pub fn new(
        offset: impl Into<String>,
        sequence_number: i64,
        enqueued_time: i64,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            offset: offset.into(),
            sequence_number,
            enqueued_time,
            partition_key: None,
            body: body.into(),
            properties: HashMap::new(),
        }
    }

    /// Stamp a published event with its broker-assigned position.
    pub fn from_event_data(
        data: EventData,
        offset: impl Into<String>,
        sequence_number: i64,
        enqueued_time: i64,
    ) -> Self {
        Self {
            offset: offset.into(),
            sequence_number,
            enqueued_time,
            partition_key: data.partition_key,
            body: data.body,
            properties: data.properties,
        }
    }

    /// The checkpoint that marks this event as processed.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.offset.clone(), self.sequence_number)
    }

    /// Body as UTF-8, if it is valid UTF-8.
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_data_size_counts_key_and_properties() {
        let bare = EventData::new("hello");
        assert_eq!(bare.size_bytes(), 5 + EVENT_OVERHEAD_BYTES);

        let keyed = EventData::new("hello")
            .with_partition_key("user-1")
            .with_property("type", "click");
        assert_eq!(keyed.size_bytes(), 5 + 6 + 4 + 5 + EVENT_OVERHEAD_BYTES);
    }

    #[test]
    fn test_received_event_checkpoint() {
        let event = ReceivedEvent::new("100", 2, 1_700_000_000_000, "payload");
        let checkpoint = event.checkpoint();
        assert_eq!(checkpoint.offset, "100");
        assert_eq!(checkpoint.sequence_number, 2);
        assert_eq!(event.body_as_str(), Some("payload"));
    }

    #[test]
    fn test_from_event_data_keeps_payload() {
        let data = EventData::new("order-created").with_property("tenant", "acme");
        let event = ReceivedEvent::from_event_data(data, "42", 7, 1000);
        assert_eq!(event.sequence_number, 7);
        assert_eq!(event.properties.get("tenant").map(String::as_str), Some("acme"));
        assert_eq!(event.body_as_str(), Some("order-created"));
    }
}
