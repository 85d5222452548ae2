//! SQLite Ownership Store Implementation
//!
//! This module implements the OwnershipStore trait using SQLite as the backend.
//!
//! ## Usage
//!
//! ### File-Based
//! ```ignore
//! use pumphouse_metadata::{SqliteOwnershipStore, OwnershipStore};
//!
//! // Creates ownership.db (or opens it if it exists)
//! let store = SqliteOwnershipStore::new("ownership.db").await?;
//! let records = store.list_ownership("orders", "$Default").await?;
//! ```
//!
//! ### In-Memory (Testing)
//! ```ignore
//! let store = SqliteOwnershipStore::new_in_memory().await?;
//! ```
//!
//! ## Implementation Details
//!
//! ### Conditional Writes
//! Every write is a single statement whose WHERE clause carries the condition, so
//! SQLite applies the compare-and-swap atomically:
//! - create: `INSERT ... ON CONFLICT DO NOTHING`
//! - claim: `UPDATE ... WHERE etag = ?`
//! - checkpoint: `UPDATE ... WHERE owner_id = ? AND sequence_number <= ?`
//!
//! Each statement ends in `RETURNING`, so a lost race shows up as "no row".
//!
//! ### Connection Pool
//! - File databases use a pool of 10 connections
//! - `sqlite::memory:` is private to one connection, so the in-memory store uses 1
//!
//! ### Migrations
//! - Run automatically on startup via `sqlx::migrate!`

use crate::{
    error::{MetadataError, Result},
    memory::new_etag,
    types::*,
    OwnershipStore,
};
use async_trait::async_trait;
use pumphouse_core::Checkpoint;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const RECORD_COLUMNS: &str = "stream_name, consumer_group, partition_id, owner_id, \
     last_modified_time, etag, sequence_number, checkpoint_offset";

/// SQLite-based ownership store implementation
pub struct SqliteOwnershipStore {
    pool: SqlitePool,
}

impl SqliteOwnershipStore {
    /// Open (or create) a SQLite ownership store at `path`
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn row_to_ownership(row: &SqliteRow) -> Result<PartitionOwnership> {
        Ok(PartitionOwnership {
            stream_name: row.try_get("stream_name")?,
            consumer_group: row.try_get("consumer_group")?,
            partition_id: row.try_get("partition_id")?,
            owner_id: row.try_get("owner_id")?,
            last_modified_time: row.try_get("last_modified_time")?,
            etag: row.try_get("etag")?,
            sequence_number: row.try_get("sequence_number")?,
            offset: row.try_get("checkpoint_offset")?,
        })
    }

    async fn create(&self, candidate: &PartitionOwnership) -> Result<Option<PartitionOwnership>> {
        let sql = format!(
            "INSERT INTO partition_ownership ({RECORD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL)
             ON CONFLICT (stream_name, consumer_group, partition_id) DO NOTHING
             RETURNING {RECORD_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&candidate.stream_name)
            .bind(&candidate.consumer_group)
            .bind(&candidate.partition_id)
            .bind(&candidate.owner_id)
            .bind(now_ms())
            .bind(new_etag())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_ownership).transpose()
    }

    async fn update_owner(
        &self,
        candidate: &PartitionOwnership,
        etag: &str,
    ) -> Result<Option<PartitionOwnership>> {
        let sql = format!(
            "UPDATE partition_ownership
             SET owner_id = ?, last_modified_time = ?, etag = ?
             WHERE stream_name = ? AND consumer_group = ? AND partition_id = ? AND etag = ?
             RETURNING {RECORD_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&candidate.owner_id)
            .bind(now_ms())
            .bind(new_etag())
            .bind(&candidate.stream_name)
            .bind(&candidate.consumer_group)
            .bind(&candidate.partition_id)
            .bind(etag)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_ownership).transpose()
    }
}

#[async_trait]
impl OwnershipStore for SqliteOwnershipStore {
    async fn list_ownership(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM partition_ownership
             WHERE stream_name = ? AND consumer_group = ?
             ORDER BY partition_id"
        );

        let rows = sqlx::query(&sql)
            .bind(stream_name)
            .bind(consumer_group)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_ownership).collect()
    }

    async fn claim_ownership(
        &self,
        candidates: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in &candidates {
            let written = match candidate.etag.as_deref() {
                None => self.create(candidate).await?,
                Some(etag) => self.update_owner(candidate, etag).await?,
            };

            match written {
                Some(record) => claimed.push(record),
                None => debug!(
                    partition_id = %candidate.partition_id,
                    owner_id = %candidate.owner_id,
                    "Ownership claim rejected"
                ),
            }
        }

        Ok(claimed)
    }

    async fn update_checkpoint(
        &self,
        key: &OwnershipKey,
        owner_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<PartitionOwnership> {
        let sql = format!(
            "UPDATE partition_ownership
             SET sequence_number = ?, checkpoint_offset = ?, last_modified_time = ?, etag = ?
             WHERE stream_name = ? AND consumer_group = ? AND partition_id = ?
               AND owner_id = ?
               AND (sequence_number IS NULL OR sequence_number <= ?)
             RETURNING {RECORD_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(checkpoint.sequence_number)
            .bind(&checkpoint.offset)
            .bind(now_ms())
            .bind(new_etag())
            .bind(&key.stream_name)
            .bind(&key.consumer_group)
            .bind(&key.partition_id)
            .bind(owner_id)
            .bind(checkpoint.sequence_number)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Self::row_to_ownership(&row);
        }

        // Nothing matched; find out which condition failed
        let current = self
            .get_ownership(key)
            .await?
            .ok_or_else(|| MetadataError::OwnershipNotFound(key.partition_id.clone()))?;

        if current.owner_id != owner_id {
            return Err(MetadataError::OwnershipLost {
                partition_id: key.partition_id.clone(),
                owner_id: owner_id.to_string(),
                current_owner: current.owner_id,
            });
        }

        Err(MetadataError::CheckpointRegression {
            partition_id: key.partition_id.clone(),
            current: current.sequence_number.unwrap_or_default(),
            attempted: checkpoint.sequence_number,
        })
    }

    async fn get_ownership(&self, key: &OwnershipKey) -> Result<Option<PartitionOwnership>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM partition_ownership
             WHERE stream_name = ? AND consumer_group = ? AND partition_id = ?"
        );

        let row = sqlx::query(&sql)
            .bind(&key.stream_name)
            .bind(&key.consumer_group)
            .bind(&key.partition_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_ownership).transpose()
    }
}
