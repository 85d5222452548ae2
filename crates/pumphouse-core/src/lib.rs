//! Pumphouse Core
//!
//! Shared data model for the pumphouse event processor. Every other crate in the
//! workspace speaks in these types:
//!
//! - **ReceivedEvent**: a record read from one partition, carrying its offset and
//!   sequence number
//! - **EventData**: an event to be sent, before the broker assigns a position
//! - **EventPosition**: where a receiver starts reading in a partition
//! - **Checkpoint**: the durable read position recorded for a partition
//! - **PartitionContext**: the (stream, consumer group, partition) a processor works on
//! - **CloseReason**: why a partition processor was closed
//! - **EventDataBatch**: size-bounded batch of events for the send path
//!
//! ## Example
//! ```ignore
//! use pumphouse_core::{Checkpoint, EventPosition};
//!
//! let checkpoint = Checkpoint::new("100", 2);
//! let resume_at = EventPosition::from_checkpoint(&checkpoint);
//! assert_eq!(resume_at, EventPosition::sequence_number(2, false));
//! ```

pub mod batch;
pub mod error;
pub mod event;
pub mod partition;
pub mod position;

pub use batch::{EventDataBatch, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{Error, Result};
pub use event::{EventData, ReceivedEvent};
pub use partition::{CloseReason, PartitionContext};
pub use position::{Checkpoint, EventPosition};
