//! In-Memory Ownership Store
//!
//! Reference implementation of `OwnershipStore`. It keeps every record in a map
//! behind a single lock, so each conditional write is trivially atomic.
//!
//! Construct one per test. Nothing here is global, so tests can run in parallel
//! without seeing each other's records.
//!
//! ## Fault Injection
//!
//! - `set_unavailable(true)` makes every operation fail with `Unavailable`
//! - `set_write_delay(d)` holds every write for `d` before applying it, which keeps
//!   checkpoint writes "in flight" long enough to observe coalescing
//! - `claim_write_count()` / `checkpoint_write_count()` count applied writes

use crate::error::{MetadataError, Result};
use crate::types::{now_ms, OwnershipKey, PartitionOwnership};
use crate::OwnershipStore;
use async_trait::async_trait;
use pumphouse_core::Checkpoint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct InMemoryOwnershipStore {
    records: RwLock<HashMap<OwnershipKey, PartitionOwnership>>,
    unavailable: AtomicBool,
    write_delay_ms: AtomicU64,
    claim_writes: AtomicU64,
    checkpoint_writes: AtomicU64,
}

impl InMemoryOwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful ownership writes.
    pub fn claim_write_count(&self) -> u64 {
        self.claim_writes.load(Ordering::SeqCst)
    }

    /// Number of successful checkpoint writes.
    pub fn checkpoint_write_count(&self) -> u64 {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    /// Overwrite the stored `last_modified_time` of a record, bypassing eTags.
    ///
    /// Lets tests age a record past its expiration without sleeping.
    pub async fn set_last_modified_time(&self, key: &OwnershipKey, last_modified_time: i64) {
        if let Some(record) = self.records.write().await.get_mut(key) {
            record.last_modified_time = last_modified_time;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_delay(&self) {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Apply one candidate under the write lock.
    fn apply_claim(
        records: &mut HashMap<OwnershipKey, PartitionOwnership>,
        candidate: PartitionOwnership,
    ) -> Result<PartitionOwnership> {
        let key = candidate.key();

        match (records.get_mut(&key), candidate.etag.as_deref()) {
            (None, None) => {
                let record = PartitionOwnership {
                    last_modified_time: now_ms(),
                    etag: Some(new_etag()),
                    ..candidate
                };
                records.insert(key, record.clone());
                Ok(record)
            }
            (Some(_), None) => Err(MetadataError::OwnershipExists(key.partition_id)),
            (None, Some(_)) => Err(MetadataError::OwnershipNotFound(key.partition_id)),
            (Some(existing), Some(etag)) => {
                if existing.etag.as_deref() != Some(etag) {
                    return Err(MetadataError::ETagMismatch(key.partition_id));
                }
                existing.owner_id = candidate.owner_id;
                existing.last_modified_time = now_ms();
                existing.etag = Some(new_etag());
                Ok(existing.clone())
            }
        }
    }
}

#[async_trait]
impl OwnershipStore for InMemoryOwnershipStore {
    async fn list_ownership(
        &self,
        stream_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        self.check_available()?;

        let records = self.records.read().await;
        let mut result: Vec<PartitionOwnership> = records
            .values()
            .filter(|r| r.stream_name == stream_name && r.consumer_group == consumer_group)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(result)
    }

    async fn claim_ownership(
        &self,
        candidates: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        self.check_available()?;
        self.write_delay().await;

        let mut records = self.records.write().await;
        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let partition_id = candidate.partition_id.clone();
            let owner_id = candidate.owner_id.clone();

            match Self::apply_claim(&mut records, candidate) {
                Ok(record) => {
                    self.claim_writes.fetch_add(1, Ordering::SeqCst);
                    claimed.push(record);
                }
                Err(e) => {
                    debug!(
                        partition_id = %partition_id,
                        owner_id = %owner_id,
                        error = %e,
                        "Ownership claim rejected"
                    );
                }
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
        self.check_available()?;
        self.write_delay().await;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| MetadataError::OwnershipNotFound(key.partition_id.clone()))?;

        if record.owner_id != owner_id {
            return Err(MetadataError::OwnershipLost {
                partition_id: key.partition_id.clone(),
                owner_id: owner_id.to_string(),
                current_owner: record.owner_id.clone(),
            });
        }

        if let Some(current) = record.sequence_number {
            if checkpoint.sequence_number < current {
                return Err(MetadataError::CheckpointRegression {
                    partition_id: key.partition_id.clone(),
                    current,
                    attempted: checkpoint.sequence_number,
                });
            }
        }

        record.sequence_number = Some(checkpoint.sequence_number);
        record.offset = Some(checkpoint.offset.clone());
        record.last_modified_time = now_ms();
        record.etag = Some(new_etag());
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);

        Ok(record.clone())
    }

    async fn get_ownership(&self, key: &OwnershipKey) -> Result<Option<PartitionOwnership>> {
        self.check_available()?;
        Ok(self.records.read().await.get(key).cloned())
    }
}

pub(crate) fn new_etag() -> String {
    uuid::Uuid::new_v4().to_string()
}
