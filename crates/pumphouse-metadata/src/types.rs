//! Ownership Record Definitions
//!
//! ## Types Overview
//!
//! ### OwnershipKey
//! Identity triple of an ownership record: (stream, consumer group, partition).
//!
//! ### PartitionOwnership
//! One record per partition per consumer group. It says which processor instance
//! currently claims the partition and how far the group has read it.
//!
//! ## Design Decisions
//!
//! - Timestamps are i64 (milliseconds since epoch), set by the store
//! - `etag` is `None` only on a candidate that has never been written; the store
//!   always returns records with an eTag
//! - An empty `owner_id` means the partition was released and is free to claim
//! - The checkpoint (`sequence_number`, `offset`) lives on the same record

use pumphouse_core::Checkpoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an ownership record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnershipKey {
    pub stream_name: String,
    pub consumer_group: String,
    pub partition_id: String,
}

impl OwnershipKey {
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
}

impl fmt::Display for OwnershipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.stream_name, self.consumer_group, self.partition_id
        )
    }
}

/// Ownership and checkpoint record of one partition.
///
/// # Fields
///
/// * `stream_name`, `consumer_group`, `partition_id` - identity, immutable
/// * `owner_id` - processor instance claiming the partition (empty = released)
/// * `last_modified_time` - last successful write (milliseconds since Unix epoch)
/// * `etag` - version token, replaced on every successful write
/// * `sequence_number`, `offset` - last checkpointed position (None = never checkpointed)
///
/// # Examples
///
/// ```ignore
/// // Candidate for a partition nobody has claimed yet
/// let candidate = PartitionOwnership::new("orders", "$Default", "0", "processor-1");
/// let claimed = store.claim_ownership(vec![candidate]).await?;
/// assert!(claimed[0].etag.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    pub stream_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub owner_id: String,
    pub last_modified_time: i64,
    pub etag: Option<String>,
    pub sequence_number: Option<i64>,
    pub offset: Option<String>,
}

impl PartitionOwnership {
    /// A fresh claim candidate with no eTag (create-only).
    pub fn new(
        stream_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            owner_id: owner_id.into(),
            last_modified_time: 0,
            etag: None,
            sequence_number: None,
            offset: None,
        }
    }

    pub fn key(&self) -> OwnershipKey {
        OwnershipKey::new(
            self.stream_name.clone(),
            self.consumer_group.clone(),
            self.partition_id.clone(),
        )
    }

    /// Candidate that takes this record over for `owner_id`, conditioned on its
    /// current eTag.
    pub fn claimed_by(&self, owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..self.clone()
        }
    }

    /// Candidate that gives this record up, conditioned on its current eTag.
    pub fn released(&self) -> Self {
        self.claimed_by(String::new())
    }

    pub fn is_released(&self) -> bool {
        self.owner_id.is_empty()
    }

    /// True once the record has not been renewed for `expiration_ms`.
    pub fn is_expired(&self, now_ms: i64, expiration_ms: i64) -> bool {
        now_ms - self.last_modified_time >= expiration_ms
    }

    /// Owned by a live instance: not released and not expired.
    pub fn is_active(&self, now_ms: i64, expiration_ms: i64) -> bool {
        !self.is_released() && !self.is_expired(now_ms, expiration_ms)
    }

    /// Last checkpoint recorded on this partition, if any.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.sequence_number.map(|sequence_number| {
            Checkpoint::new(self.offset.clone().unwrap_or_default(), sequence_number)
        })
    }
}

/// Current time in milliseconds since epoch, as the stores stamp records.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_candidate_has_no_etag_or_checkpoint() {
        let candidate = PartitionOwnership::new("orders", "$Default", "0", "processor-1");
        assert!(candidate.etag.is_none());
        assert!(candidate.checkpoint().is_none());
        assert!(!candidate.is_released());
        assert_eq!(candidate.key().to_string(), "orders/$Default/0");
    }

    #[test]
    fn test_released_keeps_etag() {
        let mut record = PartitionOwnership::new("orders", "$Default", "0", "processor-1");
        record.etag = Some("v1".to_string());

        let release = record.released();
        assert!(release.is_released());
        assert_eq!(release.etag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_expiration() {
        let mut record = PartitionOwnership::new("orders", "$Default", "0", "processor-1");
        record.last_modified_time = 10_000;

        assert!(record.is_active(15_000, 30_000));
        assert!(record.is_expired(40_000, 30_000));
        assert!(!record.is_active(40_000, 30_000));
        assert!(!record.released().is_active(15_000, 30_000));
    }

    #[test]
    fn test_checkpoint_from_record() {
        let mut record = PartitionOwnership::new("orders", "$Default", "0", "processor-1");
        record.sequence_number = Some(2);
        record.offset = Some("100".to_string());

        assert_eq!(record.checkpoint(), Some(Checkpoint::new("100", 2)));
    }
}
