//! Event Processor Configuration
//!
//! ## Environment Variables
//!
//! `EventProcessorConfig::from_env()` starts from the defaults and overlays:
//! - `PUMPHOUSE_PROCESSOR_ID`: instance identifier (default: `processor-<uuid>`)
//! - `PUMPHOUSE_CONSUMER_GROUP`: consumer group (default: `$Default`)
//! - `PUMPHOUSE_BALANCE_INTERVAL_MS`: coordination cycle interval (default: 10000)
//! - `PUMPHOUSE_OWNERSHIP_EXPIRATION_MS`: ownership expiration (default: 30000)
//! - `PUMPHOUSE_SHUTDOWN_TIMEOUT_SECS`: grace period for pumps on stop (default: 30)
//! - `PUMPHOUSE_CHECKPOINT_EVERY`: auto-checkpoint every N events (default: off)
//! - `PUMPHOUSE_CHECKPOINT_INTERVAL_MS`: auto-checkpoint interval (default: off)
//!
//! Unparseable values are ignored with a warning and the default is kept.

use crate::error::{ProcessorError, Result};
use pumphouse_core::EventPosition;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Default coordination cycle interval (10 seconds)
pub const DEFAULT_LOAD_BALANCING_INTERVAL: Duration = Duration::from_secs(10);

/// Default ownership expiration (30 seconds = 3 missed cycles)
pub const DEFAULT_OWNERSHIP_EXPIRATION: Duration = Duration::from_secs(30);

/// Default shutdown grace period for pumps (30 seconds)
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default time a closing pump waits for its last checkpoint write (5 seconds)
pub const DEFAULT_CHECKPOINT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// When pumps checkpoint on their own, without the processor asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Checkpoint after every N processed events
    pub every: Option<u64>,
    /// Checkpoint the latest processed event on this interval
    pub interval: Option<Duration>,
}

impl CheckpointPolicy {
    pub fn is_enabled(&self) -> bool {
        self.every.is_some() || self.interval.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Identifier written as `owner_id` on claimed partitions
    pub identifier: String,
    pub consumer_group: String,
    /// Time between coordination cycles
    pub load_balancing_interval: Duration,
    /// Ownership not renewed for this long is free to claim
    pub ownership_expiration: Duration,
    /// How long `stop()` waits for each pump before tearing it down
    pub shutdown_grace_period: Duration,
    /// Start position for partitions without a checkpoint
    pub default_start_position: EventPosition,
    /// Per-partition overrides of `default_start_position`
    pub initial_positions: HashMap<String, EventPosition>,
    pub checkpoint_policy: CheckpointPolicy,
    /// How long a closing pump waits for its outstanding checkpoint write
    pub checkpoint_flush_timeout: Duration,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            identifier: format!("processor-{}", uuid::Uuid::new_v4()),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            load_balancing_interval: DEFAULT_LOAD_BALANCING_INTERVAL,
            ownership_expiration: DEFAULT_OWNERSHIP_EXPIRATION,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
            default_start_position: EventPosition::Earliest,
            initial_positions: HashMap::new(),
            checkpoint_policy: CheckpointPolicy::default(),
            checkpoint_flush_timeout: DEFAULT_CHECKPOINT_FLUSH_TIMEOUT,
        }
    }
}

impl EventProcessorConfig {
    /// Defaults overlaid with `PUMPHOUSE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("PUMPHOUSE_PROCESSOR_ID") {
            config.identifier = id;
        }
        if let Some(group) = lookup("PUMPHOUSE_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(ms) = parse_u64(&lookup, "PUMPHOUSE_BALANCE_INTERVAL_MS") {
            config.load_balancing_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "PUMPHOUSE_OWNERSHIP_EXPIRATION_MS") {
            config.ownership_expiration = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "PUMPHOUSE_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_grace_period = Duration::from_secs(secs);
        }
        if let Some(every) = parse_u64(&lookup, "PUMPHOUSE_CHECKPOINT_EVERY") {
            config.checkpoint_policy.every = Some(every);
        }
        if let Some(ms) = parse_u64(&lookup, "PUMPHOUSE_CHECKPOINT_INTERVAL_MS") {
            config.checkpoint_policy.interval = Some(Duration::from_millis(ms));
        }

        config
    }

    /// Start position for a partition that has no checkpoint.
    pub fn start_position_for(&self, partition_id: &str) -> EventPosition {
        self.initial_positions
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| self.default_start_position.clone())
    }

    /// Reject configurations the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(ProcessorError::Config("identifier must not be empty".into()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ProcessorError::Config(
                "consumer group must not be empty".into(),
            ));
        }
        if self.load_balancing_interval.is_zero() {
            return Err(ProcessorError::Config(
                "load balancing interval must be greater than zero".into(),
            ));
        }
        if self.ownership_expiration <= self.load_balancing_interval {
            return Err(ProcessorError::Config(format!(
                "ownership expiration ({:?}) must be longer than the load balancing interval ({:?})",
                self.ownership_expiration, self.load_balancing_interval
            )));
        }
        if self.checkpoint_policy.every == Some(0) {
            return Err(ProcessorError::Config(
                "checkpoint_every must be greater than zero".into(),
            ));
        }
        if self.checkpoint_policy.interval.is_some_and(|d| d.is_zero()) {
            return Err(ProcessorError::Config(
                "checkpoint interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}
