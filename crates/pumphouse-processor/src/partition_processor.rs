//! Partition Processor - User Logic Plug-in
//!
//! A `PartitionProcessor` is the caller's code for one partition. The event
//! processor creates one per claimed partition through a `PartitionProcessorFactory`
//! and drives it from that partition's pump.
//!
//! ## Lifecycle
//!
//! ```text
//! initialize() ──► process_event()* ──► close(reason)
//!      │                 │
//!      └── Err ──────────┴──► process_error(&err) ──► close(reason)
//! ```
//!
//! - `process_event` is never called concurrently and always in partition order
//! - `process_error` is a notification; it cannot fail
//! - `close` is called exactly once, whatever ended the pump (except a forced abort
//!   after the shutdown grace period)
//!
//! ## Example
//!
//! ```ignore
//! struct Printer {
//!     context: PartitionContext,
//!     checkpoints: CheckpointManager,
//! }
//!
//! #[async_trait]
//! impl PartitionProcessor for Printer {
//!     async fn process_event(&mut self, event: ReceivedEvent) -> Result<(), HandlerError> {
//!         println!("{} -> {:?}", self.context, event.body_as_str());
//!         self.checkpoints.update_checkpoint(&event).await?;
//!         Ok(())
//!     }
//!
//!     async fn process_error(&mut self, error: &ProcessorError) {
//!         eprintln!("{}: {}", self.context, error);
//!     }
//! }
//!
//! let factory: PartitionProcessorFactory = Arc::new(|context, checkpoints| {
//!     Box::new(Printer { context, checkpoints })
//! });
//! ```

use crate::checkpoint::CheckpointManager;
use crate::error::{HandlerError, ProcessorError};
use async_trait::async_trait;
use pumphouse_core::{CloseReason, PartitionContext, ReceivedEvent};
use std::sync::Arc;

#[async_trait]
pub trait PartitionProcessor: Send {
    /// Called once before the first event.
    async fn initialize(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handle one event. An error closes this partition's pump.
    async fn process_event(&mut self, event: ReceivedEvent) -> Result<(), HandlerError>;

    /// Notification of the error that is about to close the pump.
    async fn process_error(&mut self, error: &ProcessorError);

    /// Called once when the pump closes.
    async fn close(&mut self, _reason: CloseReason) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Builds the processor for a newly claimed partition.
pub type PartitionProcessorFactory =
    Arc<dyn Fn(PartitionContext, CheckpointManager) -> Box<dyn PartitionProcessor> + Send + Sync>;
