//! Pumphouse Event Processor - Cooperative Partition Consumption
//!
//! This crate consumes every partition of an event stream from a fleet of
//! interchangeable processor instances, each partition read by exactly one
//! instance at a time.
//!
//! ## Architecture
//!
//! Instances never talk to each other. All coordination goes through the shared
//! `OwnershipStore` (see `pumphouse-metadata`), using conditional writes keyed by
//! eTag.
//!
//! ```text
//! ┌──────────────────── EventProcessor ────────────────────┐
//! │                                                        │   list / claim
//! │  Coordinator ──► OwnershipBalancer ────────────────────┼──────────────► OwnershipStore
//! │      │ every load_balancing_interval                   │                     ▲
//! │      ▼                                                 │                     │
//! │  PartitionPump ──► PartitionProcessor                  │                     │
//! │      ▲                    │                            │  update_checkpoint  │
//! │      │                    └──► CheckpointManager ──────┼─────────────────────┘
//! └──────┼─────────────────────────────────────────────────┘
//!        │ EventReceiver (one per owned partition)
//!    EventLink
//! ```
//!
//! ## Components
//!
//! - **EventProcessor**: lifecycle (`start`/`stop`) and the builder
//! - **OwnershipBalancer**: fair share computation, at most one steal per cycle
//! - **PartitionPump**: one task per owned partition feeding events in order
//! - **CheckpointManager**: per-partition checkpoint writes with coalescing
//! - **EventLink**: the broker seam; `MemoryEventHub` is the in-memory link
//!
//! ## Delivery
//!
//! Processing is at-least-once. After a failover or restart a partition resumes
//! right after its last checkpoint, so events processed but not yet checkpointed
//! are delivered again.
//!
//! ## Example Usage
//!
//! ```ignore
//! use pumphouse_metadata::InMemoryOwnershipStore;
//! use pumphouse_processor::{EventProcessor, MemoryEventHub};
//! use std::sync::Arc;
//!
//! let hub = MemoryEventHub::new("orders", ["0", "1", "2", "3"]);
//! let store = Arc::new(InMemoryOwnershipStore::new());
//!
//! let processor = EventProcessor::builder()
//!     .consumer_group("billing")
//!     .checkpoint_every(100)
//!     .event_link(Arc::new(hub.clone()))
//!     .ownership_store(store)
//!     .processor_factory(|context, checkpoints| Box::new(Billing::new(context, checkpoints)))
//!     .build()?;
//!
//! processor.start().await?;
//! // ... consume ...
//! processor.stop().await?;
//! ```

pub mod balancer;
pub mod checkpoint;
pub mod config;
mod coordinator;
pub mod error;
pub mod hub;
pub mod link;
pub mod metrics;
pub mod partition_processor;
pub mod processor;
mod pump;

pub use balancer::OwnershipBalancer;
pub use checkpoint::{CheckpointManager, CheckpointOutcome};
pub use config::{
    CheckpointPolicy, EventProcessorConfig, DEFAULT_CHECKPOINT_FLUSH_TIMEOUT,
    DEFAULT_CONSUMER_GROUP, DEFAULT_LOAD_BALANCING_INTERVAL, DEFAULT_OWNERSHIP_EXPIRATION,
    DEFAULT_SHUTDOWN_GRACE_PERIOD,
};
pub use coordinator::CoordinationStats;
pub use error::{HandlerError, ProcessorError, Result};
pub use hub::MemoryEventHub;
pub use link::{EventLink, EventReceiver};
pub use metrics::ProcessorMetrics;
pub use partition_processor::{PartitionProcessor, PartitionProcessorFactory};
pub use processor::{EventProcessor, EventProcessorBuilder, EventProcessorState};
pub use pump::PumpState;

pub use pumphouse_core::{
    Checkpoint, CloseReason, EventData, EventDataBatch, EventPosition, PartitionContext,
    ReceivedEvent,
};
