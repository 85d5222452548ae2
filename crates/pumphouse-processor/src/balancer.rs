//! Ownership Balancer - Fair Share Claim Computation
//!
//! Decides, once per coordination cycle, which partitions this instance should own.
//! It is a pure function of the ownership snapshot, so every instance can run it
//! independently; conflicting decisions are settled by the store's eTag check.
//!
//! ## Algorithm
//!
//! With `P` partitions and `M` live instances (distinct active owners in the
//! snapshot, plus this one):
//!
//! ```text
//! min = P / M            max = ceil(P / M)
//! ```
//!
//! 1. **Keep** partitions already owned by this instance, up to `max`
//!    (partitions with a running pump first, then lowest id)
//! 2. **Fill** from unclaimed partitions (no record, released, or expired),
//!    lowest id first, up to `max`
//! 3. **Steal** at most one partition per cycle, and only when this instance is
//!    below `min` (from an owner above `min`) or below `max` while some owner is
//!    above `max`. The victim is the busiest owner (ties: lowest owner id) and the
//!    stolen partition is its lowest id.
//!
//! The result never exceeds `max`. Balance is reached over a few cycles, not in
//! one step.

use pumphouse_metadata::PartitionOwnership;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Computes the partitions this instance should claim or renew.
#[derive(Debug, Clone)]
pub struct OwnershipBalancer {
    ownership_expiration_ms: i64,
}

impl OwnershipBalancer {
    pub fn new(ownership_expiration_ms: i64) -> Self {
        Self {
            ownership_expiration_ms,
        }
    }

    pub fn compute_claims(
        &self,
        all_partitions: &BTreeSet<String>,
        snapshot: &[PartitionOwnership],
        self_id: &str,
        previously_owned: &BTreeSet<String>,
        now_ms: i64,
    ) -> BTreeSet<String> {
        if all_partitions.is_empty() {
            return BTreeSet::new();
        }

        let records: HashMap<&str, &PartitionOwnership> = snapshot
            .iter()
            .filter(|r| all_partitions.contains(&r.partition_id))
            .map(|r| (r.partition_id.as_str(), r))
            .collect();

        let mut mine: Vec<&String> = Vec::new();
        let mut unclaimed: Vec<&String> = Vec::new();
        // BTreeMap keeps owners ordered, so ties resolve to the lowest owner id
        let mut others: BTreeMap<&str, BTreeSet<&String>> = BTreeMap::new();

        for partition_id in all_partitions {
            match records.get(partition_id.as_str()) {
                Some(record) if record.owner_id == self_id => mine.push(partition_id),
                Some(record) if record.is_active(now_ms, self.ownership_expiration_ms) => {
                    others
                        .entry(record.owner_id.as_str())
                        .or_default()
                        .insert(partition_id);
                }
                _ => unclaimed.push(partition_id),
            }
        }

        let partition_count = all_partitions.len();
        let instance_count = others.len() + 1;
        let min = partition_count / instance_count;
        let max = partition_count.div_ceil(instance_count);

        // Running pumps first, then lowest id
        mine.sort_by_key(|id| (!previously_owned.contains(*id), *id));

        let mut claims: BTreeSet<String> = mine.into_iter().take(max).cloned().collect();

        for partition_id in unclaimed {
            if claims.len() >= max {
                break;
            }
            claims.insert(partition_id.clone());
        }

        if let Some(stolen) = self.pick_steal(&others, claims.len(), min, max) {
            claims.insert(stolen.clone());
        }

        claims
    }

    fn pick_steal<'a>(
        &self,
        others: &BTreeMap<&str, BTreeSet<&'a String>>,
        owned: usize,
        min: usize,
        max: usize,
    ) -> Option<&'a String> {
        if owned >= max {
            return None;
        }

        // max_by_key returns the last maximum; iterate in reverse so the lowest
        // owner id wins ties
        let (_, victim) = others
            .iter()
            .rev()
            .max_by_key(|(_, partitions)| partitions.len())?;
        let victim_count = victim.len();

        let below_min = owned < min && victim_count > min;
        let victim_over_max = victim_count > max;

        if below_min || victim_over_max {
            victim.iter().next().copied()
        } else {
            None
        }
    }
}
