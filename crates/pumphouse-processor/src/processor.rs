//! Event Processor - Top-Level Lifecycle
//!
//! An `EventProcessor` consumes every partition of one stream on behalf of one
//! consumer group, cooperating with any number of peer instances through a
//! shared `OwnershipStore`.
//!
//! ## State Machine
//!
//! ```text
//! Stopped ──start()──► Starting ──first cycle──► Running ──stop()──► Stopping ──► Stopped
//! ```
//!
//! - `start()` while `Starting`/`Running` is a no-op
//! - `start()` while `Stopping` fails with `IllegalState`
//! - `stop()` is idempotent
//! - an invalid configuration fails `start()` with `Config` and leaves the
//!   processor `Stopped`
//!
//! Partition-level failures never surface here. Processors see them through
//! `PartitionProcessor::process_error`.
//!
//! ## Example
//!
//! ```ignore
//! let processor = EventProcessor::builder()
//!     .consumer_group("billing")
//!     .event_link(Arc::new(hub))
//!     .ownership_store(Arc::new(SqliteOwnershipStore::new("ownership.db").await?))
//!     .processor_factory(|context, checkpoints| Box::new(Billing::new(context, checkpoints)))
//!     .build()?;
//!
//! processor.start().await?;
//! // ...
//! processor.stop().await?;
//! ```

use crate::checkpoint::CheckpointManager;
use crate::config::EventProcessorConfig;
use crate::coordinator::{CoordinationStats, Coordinator};
use crate::error::{ProcessorError, Result};
use crate::link::EventLink;
use crate::metrics::ProcessorMetrics;
use crate::partition_processor::{PartitionProcessor, PartitionProcessorFactory};
use crate::pump::PumpState;
use pumphouse_core::{EventPosition, PartitionContext};
use pumphouse_metadata::OwnershipStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle state of an event processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventProcessorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct EventProcessor {
    config: EventProcessorConfig,
    metrics: ProcessorMetrics,
    coordinator: Arc<Coordinator>,
    state: Arc<RwLock<EventProcessorState>>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
    shutdown_tx: Arc<RwLock<Option<watch::Sender<bool>>>>,
}

impl EventProcessor {
    pub fn builder() -> EventProcessorBuilder {
        EventProcessorBuilder::new()
    }

    /// Begin coordinating. Resolves once the first cycle has run.
    pub async fn start(&self) -> Result<()> {
        match *self.state.read().await {
            EventProcessorState::Running | EventProcessorState::Starting => return Ok(()),
            EventProcessorState::Stopping => {
                return Err(ProcessorError::IllegalState(
                    "cannot start an event processor while it is stopping".to_string(),
                ))
            }
            EventProcessorState::Stopped => {}
        }

        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut state = self.state.write().await;
            match *state {
                EventProcessorState::Stopped => *state = EventProcessorState::Starting,
                EventProcessorState::Stopping => {
                    return Err(ProcessorError::IllegalState(
                        "cannot start an event processor while it is stopping".to_string(),
                    ))
                }
                _ => return Ok(()),
            }
        }

        if let Err(e) = self.config.validate() {
            *self.state.write().await = EventProcessorState::Stopped;
            return Err(e);
        }

        info!(
            owner_id = %self.config.identifier,
            consumer_group = %self.config.consumer_group,
            interval_ms = self.config.load_balancing_interval.as_millis() as u64,
            "Starting event processor"
        );

        self.coordinator.coordinate().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(&self.coordinator);
        let handle = tokio::spawn(async move {
            coordinator.run(shutdown_rx).await;
        });

        *self.task_handle.write().await = Some(handle);
        *self.shutdown_tx.write().await = Some(shutdown_tx);
        *self.state.write().await = EventProcessorState::Running;

        info!(owner_id = %self.config.identifier, "Event processor running");
        Ok(())
    }

    /// Stop every pump and release all owned partitions.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut state = self.state.write().await;
            if *state != EventProcessorState::Running {
                return Ok(());
            }
            *state = EventProcessorState::Stopping;
        }

        info!(owner_id = %self.config.identifier, "Stopping event processor");

        let shutdown_tx = self.shutdown_tx.write().await.take();
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        let handle = self.task_handle.write().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    owner_id = %self.config.identifier,
                    error = %e,
                    "Coordination task failed"
                );
            }
        }

        self.coordinator.shutdown().await;

        *self.state.write().await = EventProcessorState::Stopped;
        info!(owner_id = %self.config.identifier, "Event processor stopped");
        Ok(())
    }

    pub async fn state(&self) -> EventProcessorState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == EventProcessorState::Running
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn consumer_group(&self) -> &str {
        &self.config.consumer_group
    }

    pub fn config(&self) -> &EventProcessorConfig {
        &self.config
    }

    /// Partitions with a live pump on this instance, sorted.
    pub async fn owned_partitions(&self) -> Vec<String> {
        self.coordinator.owned_partitions().await
    }

    pub async fn partition_state(&self, partition_id: &str) -> Option<PumpState> {
        self.coordinator.partition_state(partition_id).await
    }

    /// Partitions closed with `Eol`; never claimed again by this instance.
    pub async fn end_of_life_partitions(&self) -> Vec<String> {
        self.coordinator.end_of_life_partitions().await
    }

    pub async fn stats(&self) -> CoordinationStats {
        self.coordinator.stats().await
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }
}

/// Builder for EventProcessor
pub struct EventProcessorBuilder {
    config: EventProcessorConfig,
    link: Option<Arc<dyn EventLink>>,
    store: Option<Arc<dyn OwnershipStore>>,
    factory: Option<PartitionProcessorFactory>,
}

impl EventProcessorBuilder {
    pub fn new() -> Self {
        Self {
            config: EventProcessorConfig::default(),
            link: None,
            store: None,
            factory: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EventProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config.identifier = identifier.into();
        self
    }

    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.config.consumer_group = consumer_group.into();
        self
    }

    pub fn load_balancing_interval(mut self, interval: Duration) -> Self {
        self.config.load_balancing_interval = interval;
        self
    }

    pub fn ownership_expiration(mut self, expiration: Duration) -> Self {
        self.config.ownership_expiration = expiration;
        self
    }

    pub fn shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_period = grace;
        self
    }

    pub fn default_start_position(mut self, position: EventPosition) -> Self {
        self.config.default_start_position = position;
        self
    }

    pub fn initial_position(mut self, partition_id: impl Into<String>, position: EventPosition) -> Self {
        self.config
            .initial_positions
            .insert(partition_id.into(), position);
        self
    }

    /// Checkpoint automatically after every `every` events
    pub fn checkpoint_every(mut self, every: u64) -> Self {
        self.config.checkpoint_policy.every = Some(every);
        self
    }

    /// Checkpoint automatically on an interval
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_policy.interval = Some(interval);
        self
    }

    pub fn checkpoint_flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.checkpoint_flush_timeout = timeout;
        self
    }

    pub fn event_link(mut self, link: Arc<dyn EventLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn ownership_store(mut self, store: Arc<dyn OwnershipStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn processor_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(PartitionContext, CheckpointManager) -> Box<dyn PartitionProcessor>
            + Send
            + Sync
            + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Build the processor. Configuration values are validated by `start()`.
    pub fn build(self) -> Result<EventProcessor> {
        let link = self
            .link
            .ok_or_else(|| ProcessorError::Config("event_link is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| ProcessorError::Config("ownership_store is required".to_string()))?;
        let factory = self
            .factory
            .ok_or_else(|| ProcessorError::Config("processor_factory is required".to_string()))?;

        let metrics = ProcessorMetrics::new();
        let coordinator = Arc::new(Coordinator::new(
            self.config.clone(),
            link,
            store,
            factory,
            metrics.clone(),
        ));

        Ok(EventProcessor {
            config: self.config,
            metrics,
            coordinator,
            state: Arc::new(RwLock::new(EventProcessorState::Stopped)),
            lifecycle: Mutex::new(()),
            task_handle: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        })
    }
}

impl Default for EventProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
