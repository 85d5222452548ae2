//! Partition identity handed to processors, and the reasons a processor is closed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Read-only view of the partition a processor is bound to.
///
/// Created once per pump and never changed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionContext {
    stream_name: String,
    consumer_group: String,
    partition_id: String,
}

impl PartitionContext {
    pub fn new(
        stream_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }
}

impl fmt::Display for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.stream_name, self.consumer_group, self.partition_id
        )
    }
}

/// Why a partition processor was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Another instance owns the partition now, or the link was taken away
    OwnershipLost,
    /// The event processor is stopping
    Shutdown,
    /// `initialize` failed
    InitializeError,
    /// `process_event` failed
    ProcessHandlerError,
    /// The partition reached end of life (for example it was merged away)
    Eol,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::OwnershipLost => "ownership_lost",
            CloseReason::Shutdown => "shutdown",
            CloseReason::InitializeError => "initialize_error",
            CloseReason::ProcessHandlerError => "process_handler_error",
            CloseReason::Eol => "eol",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
