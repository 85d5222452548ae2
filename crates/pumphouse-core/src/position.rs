//! Read Positions and Checkpoints
//!
//! `EventPosition` tells a link where to start reading a partition. `Checkpoint`
//! is the durable record of how far a consumer group has processed it.
//!
//! Checkpoints are ordered by sequence number only. Offsets are opaque broker
//! cursors and are carried along, never compared.
//!
//! Resuming from a checkpoint is exclusive: the checkpointed event was already
//! processed, so reading restarts at the next sequence number.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Starting position for a partition receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPosition {
    /// First event still retained by the partition
    Earliest,

    /// Only events enqueued after the receiver was opened
    Latest,

    /// Events at (inclusive) or after (exclusive) a broker offset
    Offset { offset: String, inclusive: bool },

    /// Events at (inclusive) or after (exclusive) a sequence number
    SequenceNumber { sequence_number: i64, inclusive: bool },

    /// Events enqueued strictly after the given time (milliseconds since epoch)
    EnqueuedTime { enqueued_time: i64 },
}

impl EventPosition {
    pub fn offset(offset: impl Into<String>, inclusive: bool) -> Self {
        EventPosition::Offset {
            offset: offset.into(),
            inclusive,
        }
    }

    pub fn sequence_number(sequence_number: i64, inclusive: bool) -> Self {
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive,
        }
    }

    pub fn enqueued_time(enqueued_time: i64) -> Self {
        EventPosition::EnqueuedTime { enqueued_time }
    }

    /// Position right after a checkpointed event.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        EventPosition::sequence_number(checkpoint.sequence_number, false)
    }
}

impl Default for EventPosition {
    fn default() -> Self {
        EventPosition::Earliest
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPosition::Earliest => write!(f, "earliest"),
            EventPosition::Latest => write!(f, "latest"),
            EventPosition::Offset { offset, inclusive } => {
                write!(f, "offset {} {}", if *inclusive { ">=" } else { ">" }, offset)
            }
            EventPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => write!(
                f,
                "sequence {} {}",
                if *inclusive { ">=" } else { ">" },
                sequence_number
            ),
            EventPosition::EnqueuedTime { enqueued_time } => {
                write!(f, "enqueued > {}", enqueued_time)
            }
        }
    }
}

/// Durable read position of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Broker offset of the last processed event
    pub offset: String,

    /// Sequence number of the last processed event
    pub sequence_number: i64,
}

impl Checkpoint {
    pub fn new(offset: impl Into<String>, sequence_number: i64) -> Self {
        Self {
            offset: offset.into(),
            sequence_number,
        }
    }

    /// Order two checkpoints of the same partition.
    pub fn progress_cmp(&self, other: &Checkpoint) -> Ordering {
        self.sequence_number.cmp(&other.sequence_number)
    }

    /// True if `self` would move progress backwards relative to `other`.
    pub fn regresses(&self, other: &Checkpoint) -> bool {
        self.progress_cmp(other) == Ordering::Less
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq={} offset={}", self.sequence_number, self.offset)
    }
}
