//! Error types for the pumphouse event processor

use pumphouse_core::CloseReason;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Error returned by user-supplied `PartitionProcessor` callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Ownership store error: {0}")]
    Metadata(#[from] pumphouse_metadata::MetadataError),

    #[error("Link error: {0}")]
    Link(#[from] pumphouse_core::Error),

    #[error("Partition processor failed to initialize: {0}")]
    Initialize(HandlerError),

    #[error("Partition processor failed to process an event: {0}")]
    ProcessEvent(HandlerError),

    #[error("Checkpoint regression for partition {partition_id}: last {last}, attempted {attempted}")]
    CheckpointRegression {
        partition_id: String,
        last: i64,
        attempted: i64,
    },

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ProcessorError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorError::IllegalState(_) => "illegal_state",
            ProcessorError::Config(_) => "config",
            ProcessorError::Metadata(_) => "metadata",
            ProcessorError::Link(e) => e.kind(),
            ProcessorError::Initialize(_) => "initialize",
            ProcessorError::ProcessEvent(_) => "process_event",
            ProcessorError::CheckpointRegression { .. } => "checkpoint_regression",
            ProcessorError::Join(_) => "join",
        }
    }

    /// Reason a pump closes with when this error ends it.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProcessorError::Initialize(_) => CloseReason::InitializeError,
            ProcessorError::ProcessEvent(_) => CloseReason::ProcessHandlerError,
            ProcessorError::Link(e) if e.is_partition_gone() => CloseReason::Eol,
            _ => CloseReason::OwnershipLost,
        }
    }
}
