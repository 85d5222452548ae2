//! Coordination Cycle
//!
//! The coordinator is the part of an `EventProcessor` that runs every
//! load-balancing interval. One cycle:
//!
//! 1. Reap pumps that finished on their own (`Eol` partitions are remembered)
//! 2. List the stream's partitions and the ownership snapshot
//! 3. Ask the `OwnershipBalancer` which partitions to hold
//! 4. Claim (or renew) them with conditional writes
//! 5. Start pumps for newly won partitions, from their checkpoint
//! 6. Stop pumps for partitions that were not won (`OwnershipLost`)
//! 7. Relinquish owned partitions the balancer gave up
//!
//! Any store or link failure in steps 2-4 skips the rest of the cycle. Running
//! pumps are left alone and the next tick tries again.

use crate::balancer::OwnershipBalancer;
use crate::checkpoint::CheckpointManager;
use crate::config::EventProcessorConfig;
use crate::error::Result;
use crate::link::EventLink;
use crate::metrics::ProcessorMetrics;
use crate::partition_processor::PartitionProcessorFactory;
use crate::pump::{PartitionPump, PumpHandle, PumpOptions, PumpState};
use pumphouse_core::{CloseReason, EventPosition, PartitionContext};
use pumphouse_metadata::{now_ms, OwnershipStore, PartitionOwnership};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters kept across cycles, logged when the coordinator stops.
#[derive(Debug, Default, Clone)]
pub struct CoordinationStats {
    pub cycle_count: u64,
    pub cycles_skipped: u64,
    pub partitions_gained: u64,
    pub partitions_lost: u64,
    pub last_cycle_ms: i64,
}

pub(crate) struct Coordinator {
    config: EventProcessorConfig,
    link: Arc<dyn EventLink>,
    store: Arc<dyn OwnershipStore>,
    factory: PartitionProcessorFactory,
    metrics: ProcessorMetrics,
    balancer: OwnershipBalancer,
    pumps: RwLock<HashMap<String, PumpHandle>>,
    /// Pumps asked to stop, still winding down
    retiring: Mutex<Vec<JoinHandle<CloseReason>>>,
    end_of_life: RwLock<BTreeSet<String>>,
    stats: RwLock<CoordinationStats>,
}

impl Coordinator {
    pub fn new(
        config: EventProcessorConfig,
        link: Arc<dyn EventLink>,
        store: Arc<dyn OwnershipStore>,
        factory: PartitionProcessorFactory,
        metrics: ProcessorMetrics,
    ) -> Self {
        let balancer = OwnershipBalancer::new(config.ownership_expiration.as_millis() as i64);
        Self {
            config,
            link,
            store,
            factory,
            metrics,
            balancer,
            pumps: RwLock::new(HashMap::new()),
            retiring: Mutex::new(Vec::new()),
            end_of_life: RwLock::new(BTreeSet::new()),
            stats: RwLock::new(CoordinationStats::default()),
        }
    }

    fn identifier(&self) -> &str {
        &self.config.identifier
    }

    fn stream_name(&self) -> &str {
        self.link.stream_name()
    }

    /// Periodic loop. Returns when `shutdown_rx` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            owner_id = %self.identifier(),
            interval_ms = self.config.load_balancing_interval.as_millis() as u64,
            "Coordination task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.load_balancing_interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.coordinate().await;
        }

        let stats = self.stats.read().await;
        info!(
            owner_id = %self.identifier(),
            cycle_count = stats.cycle_count,
            cycles_skipped = stats.cycles_skipped,
            partitions_gained = stats.partitions_gained,
            partitions_lost = stats.partitions_lost,
            "Coordination task stopped"
        );
    }

    /// Run one cycle, absorbing failures.
    pub async fn coordinate(&self) {
        let result = self.run_cycle().await;

        let mut stats = self.stats.write().await;
        stats.cycle_count += 1;
        stats.last_cycle_ms = now_ms();

        match result {
            Ok(()) => {
                self.metrics
                    .coordination_cycles
                    .with_label_values(&["ok"])
                    .inc();
            }
            Err(e) => {
                stats.cycles_skipped += 1;
                self.metrics
                    .coordination_cycles
                    .with_label_values(&["skipped"])
                    .inc();
                warn!(
                    owner_id = %self.identifier(),
                    stream = %self.stream_name(),
                    error = %e,
                    "Coordination cycle skipped"
                );
            }
        }
    }

    async fn run_cycle(&self) -> Result<()> {
        self.reap_finished().await;

        let end_of_life = self.end_of_life.read().await.clone();
        let all_partitions: BTreeSet<String> = self
            .link
            .partition_ids()
            .await?
            .into_iter()
            .filter(|id| !end_of_life.contains(id))
            .collect();

        let snapshot = self
            .store
            .list_ownership(self.stream_name(), &self.config.consumer_group)
            .await?;

        let running: BTreeSet<String> = self.pumps.read().await.keys().cloned().collect();

        let wanted = self.balancer.compute_claims(
            &all_partitions,
            &snapshot,
            self.identifier(),
            &running,
            now_ms(),
        );

        let records: HashMap<&str, &PartitionOwnership> = snapshot
            .iter()
            .map(|r| (r.partition_id.as_str(), r))
            .collect();

        let candidates: Vec<PartitionOwnership> = wanted
            .iter()
            .map(|id| match records.get(id.as_str()) {
                Some(record) => record.claimed_by(self.identifier()),
                None => PartitionOwnership::new(
                    self.stream_name(),
                    &self.config.consumer_group,
                    id,
                    self.identifier(),
                ),
            })
            .collect();

        let mut claimed = self.store.claim_ownership(candidates).await?;
        let renewed = self.retry_own_renewals(&wanted, &claimed, &records).await;
        claimed.extend(renewed);

        let won: HashMap<String, PartitionOwnership> = claimed
            .into_iter()
            .map(|r| (r.partition_id.clone(), r))
            .collect();

        for id in wanted.iter().filter(|id| !won.contains_key(*id)) {
            if !running.contains(id) {
                self.metrics.claims.with_label_values(&["lost"]).inc();
                debug!(
                    owner_id = %self.identifier(),
                    partition_id = %id,
                    "Lost claim race"
                );
            }
        }

        for (id, record) in &won {
            if !self.pumps.read().await.contains_key(id) {
                self.start_pump(record).await;
            }
        }

        let lost: Vec<String> = running
            .iter()
            .filter(|id| !won.contains_key(*id))
            .cloned()
            .collect();
        for id in &lost {
            self.retire_pump(id, CloseReason::OwnershipLost).await;
        }

        let excess: Vec<PartitionOwnership> = snapshot
            .iter()
            .filter(|r| r.owner_id == self.identifier() && !wanted.contains(&r.partition_id))
            .map(PartitionOwnership::released)
            .collect();
        self.relinquish(excess).await;

        Ok(())
    }

    /// Renewals of our own partitions can lose to our own checkpoint writes,
    /// which rotate the eTag. Retry those once with the current eTag.
    async fn retry_own_renewals(
        &self,
        wanted: &BTreeSet<String>,
        claimed: &[PartitionOwnership],
        records: &HashMap<&str, &PartitionOwnership>,
    ) -> Vec<PartitionOwnership> {
        let won: BTreeSet<&str> = claimed.iter().map(|r| r.partition_id.as_str()).collect();
        let stale: BTreeSet<&str> = wanted
            .iter()
            .map(String::as_str)
            .filter(|id| !won.contains(id))
            .filter(|id| {
                records
                    .get(id)
                    .is_some_and(|r| r.owner_id == self.identifier())
            })
            .collect();

        if stale.is_empty() {
            return Vec::new();
        }

        let current = match self
            .store
            .list_ownership(self.stream_name(), &self.config.consumer_group)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    owner_id = %self.identifier(),
                    error = %e,
                    "Failed to refresh ownership for renewal"
                );
                return Vec::new();
            }
        };

        let retries: Vec<PartitionOwnership> = current
            .iter()
            .filter(|r| {
                stale.contains(r.partition_id.as_str()) && r.owner_id == self.identifier()
            })
            .map(|r| r.claimed_by(self.identifier()))
            .collect();

        if retries.is_empty() {
            return Vec::new();
        }

        match self.store.claim_ownership(retries).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(
                    owner_id = %self.identifier(),
                    error = %e,
                    "Renewal retry failed"
                );
                Vec::new()
            }
        }
    }

    async fn start_pump(&self, record: &PartitionOwnership) {
        let partition_id = record.partition_id.clone();
        let context = PartitionContext::new(
            self.stream_name(),
            &self.config.consumer_group,
            &partition_id,
        );

        let checkpoints = CheckpointManager::with_metrics(
            context.clone(),
            self.identifier(),
            Arc::clone(&self.store),
            self.metrics.clone(),
        );

        let start_position = match record.checkpoint() {
            Some(checkpoint) => {
                checkpoints.seed(checkpoint.clone()).await;
                EventPosition::from_checkpoint(&checkpoint)
            }
            None => self.config.start_position_for(&partition_id),
        };

        let processor = (self.factory)(context.clone(), checkpoints.clone());

        let pump = PartitionPump::new(
            context,
            Arc::clone(&self.link),
            processor,
            checkpoints,
            start_position.clone(),
            PumpOptions {
                checkpoint_policy: self.config.checkpoint_policy,
                checkpoint_flush_timeout: self.config.checkpoint_flush_timeout,
            },
            self.metrics.clone(),
        );

        self.pumps
            .write()
            .await
            .insert(partition_id.clone(), PumpHandle::spawn(pump));

        self.metrics.claims.with_label_values(&["won"]).inc();
        self.stats.write().await.partitions_gained += 1;

        info!(
            owner_id = %self.identifier(),
            partition_id = %partition_id,
            position = %start_position,
            "Claimed partition, pump started"
        );
    }

    /// Signal a pump to stop and let it wind down off the cycle.
    async fn retire_pump(&self, partition_id: &str, reason: CloseReason) {
        let Some(handle) = self.pumps.write().await.remove(partition_id) else {
            return;
        };

        self.stats.write().await.partitions_lost += 1;
        info!(
            owner_id = %self.identifier(),
            partition_id = %partition_id,
            reason = %reason,
            "Stopping partition pump"
        );

        let grace = self.config.shutdown_grace_period;
        let task = tokio::spawn(async move { handle.stop(reason, grace).await });

        let mut retiring = self.retiring.lock().await;
        retiring.retain(|task| !task.is_finished());
        retiring.push(task);
    }

    /// Remove pumps that closed on their own.
    async fn reap_finished(&self) {
        let finished: Vec<PumpHandle> = {
            let mut pumps = self.pumps.write().await;
            let ids: Vec<String> = pumps
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pumps.remove(id)).collect()
        };

        for handle in finished {
            let partition_id = handle.partition_id().to_string();
            let reason = handle.join().await;

            info!(
                owner_id = %self.identifier(),
                partition_id = %partition_id,
                reason = %reason,
                "Partition pump finished"
            );

            if reason == CloseReason::Eol {
                self.end_of_life.write().await.insert(partition_id);
            }
        }
    }

    async fn relinquish(&self, releases: Vec<PartitionOwnership>) {
        if releases.is_empty() {
            return;
        }

        let requested: Vec<String> = releases.iter().map(|r| r.partition_id.clone()).collect();
        match self.store.claim_ownership(releases).await {
            Ok(released) => {
                self.metrics
                    .claims
                    .with_label_values(&["relinquished"])
                    .inc_by(released.len() as u64);
                info!(
                    owner_id = %self.identifier(),
                    requested = ?requested,
                    released = released.len(),
                    "Relinquished partitions"
                );
            }
            Err(e) => warn!(
                owner_id = %self.identifier(),
                partitions = ?requested,
                error = %e,
                "Failed to relinquish partitions"
            ),
        }
    }

    /// Stop every pump, wait for them, and give all our partitions up.
    pub async fn shutdown(&self) {
        let handles: Vec<PumpHandle> = self.pumps.write().await.drain().map(|(_, h)| h).collect();
        let grace = self.config.shutdown_grace_period;

        info!(
            owner_id = %self.identifier(),
            pumps = handles.len(),
            grace_ms = grace.as_millis() as u64,
            "Stopping partition pumps"
        );

        futures::future::join_all(
            handles
                .into_iter()
                .map(|handle| handle.stop(CloseReason::Shutdown, grace)),
        )
        .await;

        let retiring: Vec<JoinHandle<CloseReason>> =
            self.retiring.lock().await.drain(..).collect();
        for task in retiring {
            let _ = task.await;
        }

        self.relinquish_all().await;
    }

    async fn relinquish_all(&self) {
        match self
            .store
            .list_ownership(self.stream_name(), &self.config.consumer_group)
            .await
        {
            Ok(records) => {
                let owned: Vec<PartitionOwnership> = records
                    .iter()
                    .filter(|r| r.owner_id == self.identifier())
                    .map(PartitionOwnership::released)
                    .collect();
                self.relinquish(owned).await;
            }
            Err(e) => warn!(
                owner_id = %self.identifier(),
                error = %e,
                "Failed to list ownership on shutdown; partitions will expire"
            ),
        }
    }

    pub async fn owned_partitions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pumps.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn partition_state(&self, partition_id: &str) -> Option<PumpState> {
        self.pumps
            .read()
            .await
            .get(partition_id)
            .map(PumpHandle::state)
    }

    pub async fn end_of_life_partitions(&self) -> Vec<String> {
        self.end_of_life.read().await.iter().cloned().collect()
    }

    pub async fn stats(&self) -> CoordinationStats {
        self.stats.read().await.clone()
    }
}
