//! Pumphouse Ownership Store
//!
//! This crate implements the shared record of who consumes which partition, and how
//! far each partition has been consumed.
//!
//! ## Purpose
//!
//! A fleet of event processors coordinates without a lock manager. The only shared
//! state is one ownership record per (stream, consumer group, partition):
//! - **Ownership**: which processor instance currently claims the partition
//! - **Checkpoint**: the last sequence number / offset the group has processed
//!
//! ## Concurrency Model
//!
//! Every record carries an eTag. Writes are compare-and-swap:
//! - a candidate with `etag = None` creates the record, and fails if one exists
//! - a candidate with `etag = Some(v)` updates the record only if its eTag is still `v`
//! - every successful write replaces the eTag
//!
//! Losing a race is not an error of the store. `claim_ownership` simply leaves the
//! losing candidate out of its result.
//!
//! ```text
//! ┌──────────────┐   list / claim    ┌──────────────────┐
//! │ Processor A  │ ────────────────► │                  │
//! └──────────────┘                   │  OwnershipStore  │
//! ┌──────────────┐   list / claim    │ (memory/SQLite)  │
//! │ Processor B  │ ────────────────► │                  │
//! └──────────────┘                   └──────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use pumphouse_metadata::{InMemoryOwnershipStore, OwnershipStore, PartitionOwnership};
//!
//! let store = InMemoryOwnershipStore::new();
//!
//! let claimed = store
//!     .claim_ownership(vec![PartitionOwnership::new("orders", "$Default", "0", "processor-1")])
//!     .await?;
//!
//! let records = store.list_ownership("orders", "$Default").await?;
//! assert_eq!(records[0].owner_id, "processor-1");
//! ```

pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{MetadataError, Result};
pub use memory::InMemoryOwnershipStore;
pub use store::SqliteOwnershipStore;
pub use types::*;

use async_trait::async_trait;
use pumphouse_core::Checkpoint;

/// Ownership store trait - abstracts over different storage backends.
///
/// ## Implementations
///
/// - **InMemoryOwnershipStore**: reference implementation, one instance per test
/// - **SqliteOwnershipStore**: durable implementation on SQLite
///
/// ## Thread Safety
///
/// All implementations must be Send + Sync, allowing safe sharing across async tasks
/// via Arc<dyn OwnershipStore>.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// List every ownership record of a (stream, consumer group), ordered by partition id.
    ///
    /// The result is a point-in-time copy; nothing is locked.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: the store could not be read
    async fn list_ownership(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>>;

    /// Conditionally write a set of ownership candidates.
    ///
    /// Each candidate is applied independently:
    /// - `etag = None` creates the record, failing if it already exists
    /// - `etag = Some(v)` updates `owner_id` if the stored eTag is still `v`
    ///
    /// Claims never touch the stored checkpoint. Candidates that lose a race are
    /// left out of the result without side effects.
    ///
    /// # Returns
    ///
    /// The records as stored after each successful write (new eTag, new
    /// `last_modified_time`).
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `DatabaseError`: the store could not be reached; nothing
    ///   is known about which candidates were applied
    async fn claim_ownership(
        &self,
        candidates: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>>;

    /// Record a checkpoint on a partition owned by `owner_id`.
    ///
    /// # Errors
    ///
    /// - `OwnershipNotFound`: no ownership record exists
    /// - `OwnershipLost`: the record is owned by somebody else
    /// - `CheckpointRegression`: the stored sequence number is higher
    /// - `Unavailable` / `DatabaseError`: the store could not be reached
    async fn update_checkpoint(
        &self,
        key: &OwnershipKey,
        owner_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<PartitionOwnership>;

    /// Read a single ownership record.
    async fn get_ownership(&self, key: &OwnershipKey) -> Result<Option<PartitionOwnership>> {
        let records = self
            .list_ownership(&key.stream_name, &key.consumer_group)
            .await?;
        Ok(records
            .into_iter()
            .find(|record| record.partition_id == key.partition_id))
    }
}
