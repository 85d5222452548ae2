//! Ownership Store Error Types
//!
//! ## Error Categories
//!
//! ### Concurrency Errors (expected, retried by callers)
//! - `ETagMismatch`: conditional write presented a stale eTag
//! - `OwnershipExists`: create attempted for a record that already exists
//!
//! ### Ownership Errors
//! - `OwnershipNotFound`: no record exists for the partition
//! - `OwnershipLost`: a checkpoint was written by an instance that no longer owns the partition
//! - `CheckpointRegression`: a checkpoint would move progress backwards
//!
//! ### Backend Errors
//! - `Unavailable`: the store cannot be reached at all
//! - `DatabaseError`: SQLite/database operation failed
//! - `MigrationError`: schema setup failed
//!
//! ## Usage
//!
//! ```ignore
//! match store.update_checkpoint(&key, "processor-1", &checkpoint).await {
//!     Ok(record) => println!("checkpointed, etag {:?}", record.etag),
//!     Err(MetadataError::OwnershipLost { .. }) => println!("someone else owns it now"),
//!     Err(e) => return Err(e),
//! }
//! ```

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("ETag mismatch for partition {0}")]
    ETagMismatch(String),

    #[error("Ownership already exists for partition {0}")]
    OwnershipExists(String),

    #[error("Ownership not found for partition {0}")]
    OwnershipNotFound(String),

    #[error("Partition {partition_id} is owned by '{current_owner}', not '{owner_id}'")]
    OwnershipLost {
        partition_id: String,
        owner_id: String,
        current_owner: String,
    },

    #[error("Checkpoint regression for partition {partition_id}: stored sequence {current}, attempted {attempted}")]
    CheckpointRegression {
        partition_id: String,
        current: i64,
        attempted: i64,
    },

    #[error("Ownership store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl MetadataError {
    /// Lost an optimistic-concurrency race. Not a failure of the store.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MetadataError::ETagMismatch(_) | MetadataError::OwnershipExists(_)
        )
    }
}

impl From<sqlx::migrate::MigrateError> for MetadataError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        MetadataError::MigrationError(e.to_string())
    }
}
