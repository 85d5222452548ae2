//! Partition Pump - Per-Partition Consumption Task
//!
//! A pump drives one `PartitionProcessor` against one `EventReceiver` for as long
//! as this instance owns the partition. Every owned partition has its own pump
//! task; pumps never share a processor or a receiver.
//!
//! ## State Machine
//!
//! ```text
//! Initializing ──► Running ──► Closing ──► Closed
//!      │                          ▲
//!      └── initialize() failed ───┘
//! ```
//!
//! ## Close Reasons
//!
//! - stop requested by the event processor: the reason it sent (`Shutdown`,
//!   `OwnershipLost`)
//! - `initialize()` failed: `InitializeError`
//! - `process_event()` failed: `ProcessHandlerError`
//! - receiver ended with "partition not found": `Eol`
//! - receiver ended with any other error, or without one: `OwnershipLost`
//!
//! Every error that ends a pump is reported to `process_error` first.
//!
//! ## Cancellation
//!
//! The stop signal is checked between events. An event already handed to
//! `process_event` is always finished before the pump honors the stop.
//! `PumpHandle::stop` bounds the wait with a grace period and aborts the task
//! when it expires.

use crate::checkpoint::CheckpointManager;
use crate::config::CheckpointPolicy;
use crate::error::ProcessorError;
use crate::link::{EventLink, EventReceiver};
use crate::metrics::ProcessorMetrics;
use crate::partition_processor::PartitionProcessor;
use prometheus::IntGauge;
use pumphouse_core::{Checkpoint, CloseReason, EventPosition, PartitionContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle state of a partition pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Initializing,
    Running,
    Closing,
    Closed,
}

/// Consumption settings shared by every pump of a processor.
#[derive(Debug, Clone)]
pub(crate) struct PumpOptions {
    pub checkpoint_policy: CheckpointPolicy,
    pub checkpoint_flush_timeout: Duration,
}

pub(crate) struct PartitionPump {
    context: PartitionContext,
    link: Arc<dyn EventLink>,
    processor: Box<dyn PartitionProcessor>,
    checkpoints: CheckpointManager,
    start_position: EventPosition,
    options: PumpOptions,
    metrics: ProcessorMetrics,
    state_tx: watch::Sender<PumpState>,
    /// Last processed event not yet handed to the checkpoint manager
    unrecorded: Option<Checkpoint>,
    since_checkpoint: u64,
}

impl PartitionPump {
    pub fn new(
        context: PartitionContext,
        link: Arc<dyn EventLink>,
        processor: Box<dyn PartitionProcessor>,
        checkpoints: CheckpointManager,
        start_position: EventPosition,
        options: PumpOptions,
        metrics: ProcessorMetrics,
    ) -> Self {
        let (state_tx, _) = watch::channel(PumpState::Initializing);
        Self {
            context,
            link,
            processor,
            checkpoints,
            start_position,
            options,
            metrics,
            state_tx,
            unrecorded: None,
            since_checkpoint: 0,
        }
    }

    /// Run the pump to completion and return why it closed.
    pub async fn run(mut self, mut stop_rx: watch::Receiver<Option<CloseReason>>) -> CloseReason {
        let partition_id = self.context.partition_id().to_string();

        info!(
            partition_id = %partition_id,
            position = %self.start_position,
            "Partition pump initializing"
        );

        if let Err(e) = self.processor.initialize().await {
            let error = ProcessorError::Initialize(e);
            self.report(&error).await;
            return self.close(error.close_reason(), None).await;
        }

        let pending_stop = *stop_rx.borrow_and_update();
        if let Some(reason) = pending_stop {
            return self.close(reason, None).await;
        }

        let mut receiver = match self
            .link
            .open(&partition_id, self.start_position.clone())
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                let error = ProcessorError::Link(e);
                self.report(&error).await;
                return self.close(error.close_reason(), None).await;
            }
        };

        self.set_state(PumpState::Running);
        info!(partition_id = %partition_id, "Partition pump running");

        let reason = self.consume(receiver.as_mut(), &mut stop_rx).await;
        self.close(reason, Some(receiver)).await
    }

    async fn consume(
        &mut self,
        receiver: &mut dyn EventReceiver,
        stop_rx: &mut watch::Receiver<Option<CloseReason>>,
    ) -> CloseReason {
        let mut interval = self.options.checkpoint_policy.interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    match changed {
                        Ok(()) => {
                            if let Some(reason) = *stop_rx.borrow_and_update() {
                                return reason;
                            }
                        }
                        // Handle dropped without a stop: nobody owns this pump anymore
                        Err(_) => return CloseReason::Shutdown,
                    }
                }

                _ = tick(&mut interval) => {
                    self.auto_checkpoint().await;
                }

                next = receiver.next_event() => match next {
                    Some(Ok(event)) => {
                        let checkpoint = event.checkpoint();

                        if let Err(e) = self.processor.process_event(event).await {
                            let error = ProcessorError::ProcessEvent(e);
                            self.report(&error).await;
                            return error.close_reason();
                        }

                        self.metrics
                            .events_processed
                            .with_label_values(&[self.context.partition_id()])
                            .inc();
                        self.unrecorded = Some(checkpoint);
                        self.since_checkpoint += 1;

                        if let Some(every) = self.options.checkpoint_policy.every {
                            if self.since_checkpoint >= every {
                                self.auto_checkpoint().await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let error = ProcessorError::Link(e);
                        self.report(&error).await;
                        return error.close_reason();
                    }
                    None => {
                        info!(
                            partition_id = %self.context.partition_id(),
                            "Receiver ended"
                        );
                        return CloseReason::OwnershipLost;
                    }
                }
            }
        }
    }

    /// Checkpoint the last processed event if the policy asks for it.
    async fn auto_checkpoint(&mut self) {
        if !self.options.checkpoint_policy.is_enabled() {
            return;
        }
        let Some(checkpoint) = self.unrecorded.take() else {
            return;
        };
        self.since_checkpoint = 0;

        match self.checkpoints.update_checkpoint_to(checkpoint).await {
            Ok(outcome) => debug!(
                partition_id = %self.context.partition_id(),
                outcome = ?outcome,
                "Automatic checkpoint"
            ),
            // The processor checkpointed past this event itself
            Err(ProcessorError::CheckpointRegression { .. }) => {}
            Err(e) => warn!(
                partition_id = %self.context.partition_id(),
                error = %e,
                "Automatic checkpoint failed"
            ),
        }
    }

    async fn report(&mut self, error: &ProcessorError) {
        warn!(
            partition_id = %self.context.partition_id(),
            kind = error.kind(),
            error = %error,
            "Partition pump error"
        );
        self.metrics
            .process_errors
            .with_label_values(&[self.context.partition_id(), error.kind()])
            .inc();
        self.processor.process_error(error).await;
    }

    async fn close(
        mut self,
        reason: CloseReason,
        receiver: Option<Box<dyn EventReceiver>>,
    ) -> CloseReason {
        self.set_state(PumpState::Closing);

        if reason == CloseReason::Shutdown {
            self.auto_checkpoint().await;
        }

        if let Err(e) = self.processor.close(reason).await {
            warn!(
                partition_id = %self.context.partition_id(),
                reason = %reason,
                error = %e,
                "Partition processor close failed"
            );
        }

        if let Some(mut receiver) = receiver {
            if let Err(e) = receiver.close().await {
                warn!(
                    partition_id = %self.context.partition_id(),
                    error = %e,
                    "Failed to close receiver"
                );
            }
        }

        let flush_timeout = self.options.checkpoint_flush_timeout;
        if tokio::time::timeout(flush_timeout, self.checkpoints.flush())
            .await
            .is_err()
        {
            warn!(
                partition_id = %self.context.partition_id(),
                timeout_ms = flush_timeout.as_millis() as u64,
                "Abandoning in-flight checkpoint write"
            );
        }
        self.checkpoints.close().await;

        self.set_state(PumpState::Closed);
        info!(
            partition_id = %self.context.partition_id(),
            reason = %reason,
            "Partition pump closed"
        );
        reason
    }

    fn set_state(&self, state: PumpState) {
        self.state_tx.send_replace(state);
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Decrements the active pump gauge when the pump task ends, even if aborted.
struct ActivePump(IntGauge);

impl ActivePump {
    fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActivePump {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// The event processor's grip on a running pump.
pub(crate) struct PumpHandle {
    partition_id: String,
    stop_tx: watch::Sender<Option<CloseReason>>,
    state_rx: watch::Receiver<PumpState>,
    checkpoints: CheckpointManager,
    join: JoinHandle<CloseReason>,
}

impl PumpHandle {
    pub fn spawn(pump: PartitionPump) -> Self {
        let partition_id = pump.context.partition_id().to_string();
        let (stop_tx, stop_rx) = watch::channel(None);
        let state_rx = pump.state_tx.subscribe();
        let checkpoints = pump.checkpoints.clone();
        let active = ActivePump::new(pump.metrics.active_pumps.clone());

        let join = tokio::spawn(async move {
            let _active = active;
            pump.run(stop_rx).await
        });

        Self {
            partition_id,
            stop_tx,
            state_rx,
            checkpoints,
            join,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn state(&self) -> PumpState {
        *self.state_rx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the pump to stop. The first reason sent wins.
    pub fn request_stop(&self, reason: CloseReason) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Stop the pump, waiting at most `grace` before tearing it down.
    pub async fn stop(mut self, reason: CloseReason, grace: Duration) -> CloseReason {
        self.request_stop(reason);

        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(Ok(closed_with)) => closed_with,
            Ok(Err(e)) => {
                warn!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Partition pump task failed"
                );
                self.checkpoints.close().await;
                reason
            }
            Err(_) => {
                warn!(
                    partition_id = %self.partition_id,
                    grace_ms = grace.as_millis() as u64,
                    "Partition pump did not stop within grace period, aborting"
                );
                self.join.abort();
                self.checkpoints.close().await;
                reason
            }
        }
    }

    /// Collect the close reason of a pump that has already finished.
    pub async fn join(self) -> CloseReason {
        match self.join.await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Partition pump task failed"
                );
                self.checkpoints.close().await;
                CloseReason::OwnershipLost
            }
        }
    }
}
