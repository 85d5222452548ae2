//! Checkpoint Manager - Coalesced Progress Writes
//!
//! One `CheckpointManager` exists per partition pump. Partition processors use it
//! to record how far they have processed the partition.
//!
//! ## Write Coalescing
//!
//! At most one checkpoint write per partition is outstanding at any time:
//!
//! ```text
//! update(5) ──► writer task: write(5) ─────────► write(9) ──► idle
//! update(7) ──► pending = 7  (Coalesced)            ▲
//! update(9) ──► pending = 9  (Coalesced) ───────────┘
//! ```
//!
//! - The first call spawns a writer task and waits for its own write
//! - Calls made while a write is in flight replace the single pending slot and
//!   return immediately
//! - The writer drains the slot until it is empty, so the store always converges
//!   to the newest position
//!
//! ## Monotonicity
//!
//! A position lower than the highest one this manager has accepted is rejected
//! locally, without contacting the store. Equal positions are no-ops.
//!
//! ## Failures
//!
//! A failed store write is returned to the caller (or logged, for coalesced
//! writes) and never stops the pump. The next call retries with its own position.

use crate::error::{ProcessorError, Result};
use crate::metrics::ProcessorMetrics;
use pumphouse_core::{Checkpoint, PartitionContext, ReceivedEvent};
use pumphouse_metadata::{MetadataError, OwnershipKey, OwnershipStore};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What happened to a checkpoint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Written to the store by this call
    Written,
    /// A write was in flight; this position will be written after it
    Coalesced,
    /// Same position as the last accepted one; nothing to do
    Unchanged,
}

#[derive(Default)]
struct CheckpointState {
    /// Last position the store acknowledged
    last_written: Option<Checkpoint>,
    /// Highest position accepted from callers
    highest: Option<Checkpoint>,
    /// Single slot for the next write
    pending: Option<Checkpoint>,
    writing: bool,
    writer: Option<JoinHandle<()>>,
    closed: bool,
}

struct CheckpointInner {
    context: PartitionContext,
    key: OwnershipKey,
    owner_id: String,
    store: Arc<dyn OwnershipStore>,
    metrics: Option<ProcessorMetrics>,
    state: Mutex<CheckpointState>,
    idle: Notify,
}

/// Records processing progress of one partition. Cheap to clone.
#[derive(Clone)]
pub struct CheckpointManager {
    inner: Arc<CheckpointInner>,
}

impl CheckpointManager {
    pub fn new(
        context: PartitionContext,
        owner_id: impl Into<String>,
        store: Arc<dyn OwnershipStore>,
    ) -> Self {
        Self::build(context, owner_id.into(), store, None)
    }

    pub(crate) fn with_metrics(
        context: PartitionContext,
        owner_id: impl Into<String>,
        store: Arc<dyn OwnershipStore>,
        metrics: ProcessorMetrics,
    ) -> Self {
        Self::build(context, owner_id.into(), store, Some(metrics))
    }

    fn build(
        context: PartitionContext,
        owner_id: String,
        store: Arc<dyn OwnershipStore>,
        metrics: Option<ProcessorMetrics>,
    ) -> Self {
        let key = OwnershipKey::new(
            context.stream_name(),
            context.consumer_group(),
            context.partition_id(),
        );

        Self {
            inner: Arc::new(CheckpointInner {
                context,
                key,
                owner_id,
                store,
                metrics,
                state: Mutex::new(CheckpointState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Start from a checkpoint already persisted in the store.
    pub(crate) async fn seed(&self, checkpoint: Checkpoint) {
        let mut state = self.inner.state.lock().await;
        state.last_written = Some(checkpoint.clone());
        state.highest = Some(checkpoint);
    }

    pub fn context(&self) -> &PartitionContext {
        &self.inner.context
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Mark `event` (and everything before it) as processed.
    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<CheckpointOutcome> {
        self.update_checkpoint_to(event.checkpoint()).await
    }

    /// Record an explicit position.
    pub async fn update_checkpoint_to(&self, checkpoint: Checkpoint) -> Result<CheckpointOutcome> {
        let reply = {
            let mut state = self.inner.state.lock().await;

            if state.closed {
                return Err(ProcessorError::IllegalState(format!(
                    "checkpoint manager for partition {} is closed",
                    self.inner.context.partition_id()
                )));
            }

            if let Some(highest) = &state.highest {
                if checkpoint.regresses(highest) {
                    self.inner.record("rejected");
                    return Err(ProcessorError::CheckpointRegression {
                        partition_id: self.inner.context.partition_id().to_string(),
                        last: highest.sequence_number,
                        attempted: checkpoint.sequence_number,
                    });
                }
                if checkpoint.progress_cmp(highest).is_eq() {
                    return Ok(CheckpointOutcome::Unchanged);
                }
            }

            state.highest = Some(checkpoint.clone());

            if state.writing {
                state.pending = Some(checkpoint);
                return Ok(CheckpointOutcome::Coalesced);
            }

            state.writing = true;
            let (tx, rx) = oneshot::channel();
            let inner = Arc::clone(&self.inner);
            state.writer = Some(tokio::spawn(async move {
                inner.run_writer(checkpoint, tx).await;
            }));
            rx
        };

        match reply.await {
            Ok(Ok(())) => Ok(CheckpointOutcome::Written),
            Ok(Err(e)) => Err(ProcessorError::Metadata(e)),
            Err(_) => Err(ProcessorError::IllegalState(format!(
                "checkpoint writer for partition {} stopped",
                self.inner.context.partition_id()
            ))),
        }
    }

    /// Wait until no write is in flight or pending.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if !self.inner.state.lock().await.writing {
                return;
            }

            idle.await;
        }
    }

    /// Stop accepting checkpoints and abandon any write still in flight.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.pending = None;
        if let Some(writer) = state.writer.take() {
            writer.abort();
        }
        state.writing = false;
        drop(state);

        self.inner.idle.notify_waiters();
    }

    /// Last position acknowledged by the store.
    pub async fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.state.lock().await.last_written.clone()
    }
}

impl CheckpointInner {
    async fn run_writer(
        &self,
        first: Checkpoint,
        reply: oneshot::Sender<std::result::Result<(), MetadataError>>,
    ) {
        let result = self.write(first).await;
        let _ = reply.send(result);

        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.pending.take() {
                    Some(next) => next,
                    None => {
                        state.writing = false;
                        drop(state);
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };

            if let Err(e) = self.write(next).await {
                warn!(
                    partition_id = %self.context.partition_id(),
                    owner_id = %self.owner_id,
                    error = %e,
                    "Coalesced checkpoint write failed"
                );
            }
        }
    }

    async fn write(&self, checkpoint: Checkpoint) -> std::result::Result<(), MetadataError> {
        let result = self
            .store
            .update_checkpoint(&self.key, &self.owner_id, &checkpoint)
            .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(_) => {
                debug!(
                    partition_id = %self.context.partition_id(),
                    checkpoint = %checkpoint,
                    "Checkpoint written"
                );
                self.record("written");
                state.last_written = Some(checkpoint);
                Ok(())
            }
            Err(e) => {
                self.record("failed");
                // Let the same position be retried when nothing newer is queued
                if state.pending.is_none() && state.highest.as_ref() == Some(&checkpoint) {
                    state.highest = state.last_written.clone();
                }
                Err(e)
            }
        }
    }

    fn record(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.checkpoint_writes.with_label_values(&[result]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumphouse_metadata::{InMemoryOwnershipStore, PartitionOwnership};
    use std::time::Duration;

    async fn setup(partition: &str) -> (Arc<InMemoryOwnershipStore>, CheckpointManager) {
        let store = Arc::new(InMemoryOwnershipStore::new());
        store
            .claim_ownership(vec![PartitionOwnership::new(
                "test-eh",
                "test-consumer1",
                partition,
                "p1",
            )])
            .await
            .unwrap();

        let context = PartitionContext::new("test-eh", "test-consumer1", partition);
        let manager = CheckpointManager::new(context, "p1", store.clone());
        (store, manager)
    }

    fn key(partition: &str) -> OwnershipKey {
        OwnershipKey::new("test-eh", "test-consumer1", partition)
    }

    #[tokio::test]
    async fn test_update_writes_to_store() {
        let (store, manager) = setup("1").await;

        let first = ReceivedEvent::new("1", 1, 0, "a");
        let second = ReceivedEvent::new("100", 2, 0, "b");
        assert_eq!(
            manager.update_checkpoint(&first).await.unwrap(),
            CheckpointOutcome::Written
        );
        assert_eq!(
            manager.update_checkpoint(&second).await.unwrap(),
            CheckpointOutcome::Written
        );

        let record = store.get_ownership(&key("1")).await.unwrap().unwrap();
        assert_eq!(record.sequence_number, Some(2));
        assert_eq!(record.offset.as_deref(), Some("100"));
        assert!(record.etag.is_some());
        assert_eq!(manager.last_checkpoint().await, Some(Checkpoint::new("100", 2)));
    }

    #[tokio::test]
    async fn test_regression_rejected_locally() {
        let (store, manager) = setup("0").await;
        manager
            .update_checkpoint_to(Checkpoint::new("500", 5))
            .await
            .unwrap();
        let writes = store.checkpoint_write_count();

        let result = manager.update_checkpoint_to(Checkpoint::new("300", 3)).await;
        assert!(matches!(
            result,
            Err(ProcessorError::CheckpointRegression {
                last: 5,
                attempted: 3,
                ..
            })
        ));

        let same = manager
            .update_checkpoint_to(Checkpoint::new("500", 5))
            .await
            .unwrap();
        assert_eq!(same, CheckpointOutcome::Unchanged);
        assert_eq!(store.checkpoint_write_count(), writes);
    }

    #[tokio::test]
    async fn test_rapid_updates_coalesce() {
        let (store, manager) = setup("0").await;
        store.set_write_delay(Duration::from_millis(100));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .update_checkpoint_to(Checkpoint::new("1", 1))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        for seq in 2..=10 {
            let outcome = manager
                .update_checkpoint_to(Checkpoint::new(seq.to_string(), seq))
                .await
                .unwrap();
            assert_eq!(outcome, CheckpointOutcome::Coalesced);
        }

        assert_eq!(first.await.unwrap(), CheckpointOutcome::Written);
        manager.flush().await;

        let record = store.get_ownership(&key("0")).await.unwrap().unwrap();
        assert_eq!(record.sequence_number, Some(10));
        assert_eq!(store.checkpoint_write_count(), 2);
    }

    #[tokio::test]
    async fn test_store_converges_to_maximum() {
        let (store, manager) = setup("0").await;
        store.set_write_delay(Duration::from_millis(2));

        let mut handles = Vec::new();
        for worker in 0..4i64 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25i64 {
                    let seq = (i * 4 + worker * 7) % 100;
                    let _ = manager
                        .update_checkpoint_to(Checkpoint::new(seq.to_string(), seq))
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        manager.flush().await;

        let record = store.get_ownership(&key("0")).await.unwrap().unwrap();
        let expected = (0..4i64)
            .flat_map(|w| (0..25i64).map(move |i| (i * 4 + w * 7) % 100))
            .max()
            .unwrap();
        assert_eq!(record.sequence_number, Some(expected));
    }

    #[tokio::test]
    async fn test_failed_write_can_be_retried() {
        let (store, manager) = setup("0").await;

        store.set_unavailable(true);
        let failed = manager.update_checkpoint_to(Checkpoint::new("4", 4)).await;
        assert!(matches!(failed, Err(ProcessorError::Metadata(_))));

        store.set_unavailable(false);
        let retried = manager
            .update_checkpoint_to(Checkpoint::new("4", 4))
            .await
            .unwrap();
        assert_eq!(retried, CheckpointOutcome::Written);
        assert_eq!(manager.last_checkpoint().await, Some(Checkpoint::new("4", 4)));
    }

    #[tokio::test]
    async fn test_write_after_ownership_lost() {
        let (store, manager) = setup("0").await;
        let record = store.get_ownership(&key("0")).await.unwrap().unwrap();
        store
            .claim_ownership(vec![record.claimed_by("p2")])
            .await
            .unwrap();

        let result = manager.update_checkpoint_to(Checkpoint::new("1", 1)).await;
        assert!(matches!(
            result,
            Err(ProcessorError::Metadata(MetadataError::OwnershipLost { .. }))
        ));
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_updates() {
        let (_store, manager) = setup("0").await;
        manager.close().await;
        manager.close().await;

        let result = manager.update_checkpoint_to(Checkpoint::new("1", 1)).await;
        assert!(matches!(result, Err(ProcessorError::IllegalState(_))));
        manager.flush().await;
    }
}
