//! Error Types for Pumphouse links
//!
//! Errors raised by the transport side of the system: opening a receiver,
//! reading from a partition, or building a batch to send.
//!
//! ## Error Categories
//!
//! ### Ownership Errors
//! - `OwnershipStolen`: another receiver with a higher priority took the partition
//!
//! ### Broker Errors
//! - `QuotaExceeded`: the broker refused the link (too many receivers, throttling)
//! - `PartitionNotFound`: the partition no longer exists (end of life)
//! - `LinkClosed`: the link was closed underneath the caller
//! - `Transport`: any other I/O failure
//!
//! ### Data Errors
//! - `EventTooLarge`: a single event does not fit into an empty batch
//! - `InvalidPosition`: a start position could not be interpreted

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Ownership of partition {0} stolen by a receiver with higher priority")]
    OwnershipStolen(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Event too large: {size} bytes exceeds limit of {max} bytes")]
    EventTooLarge { size: usize, max: usize },

    #[error("Invalid position: {0}")]
    InvalidPosition(String),
}

impl Error {
    /// True when the partition itself is permanently gone and must not be
    /// claimed again.
    pub fn is_partition_gone(&self) -> bool {
        matches!(self, Error::PartitionNotFound(_))
    }

    /// Short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::OwnershipStolen(_) => "ownership_stolen",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::PartitionNotFound(_) => "partition_not_found",
            Error::LinkClosed(_) => "link_closed",
            Error::Transport(_) => "transport",
            Error::EventTooLarge { .. } => "event_too_large",
            Error::InvalidPosition(_) => "invalid_position",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_partition_is_gone() {
        assert!(Error::PartitionNotFound("3".to_string()).is_partition_gone());
        assert!(!Error::OwnershipStolen("3".to_string()).is_partition_gone());
        assert!(!Error::QuotaExceeded("receivers".to_string()).is_partition_gone());
        assert!(!Error::Transport("reset".to_string()).is_partition_gone());
    }

    #[test]
    fn test_error_display() {
        let err = Error::EventTooLarge { size: 2048, max: 1024 };
        assert_eq!(
            err.to_string(),
            "Event too large: 2048 bytes exceeds limit of 1024 bytes"
        );
        assert_eq!(err.kind(), "event_too_large");
    }
}
